//! Table and CSV output helpers.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Rows printed either as a table or, in machine mode, as CSV.
pub struct Listing {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Listing {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self, machine: bool) -> String {
        if machine {
            return self.to_csv();
        }
        let headers: Vec<&str> = self.headers.iter().map(String::as_str).collect();
        let mut table = new_table(&headers);
        for row in &self.rows {
            table.add_row(row);
        }
        table.to_string()
    }

    pub fn print(&self, machine: bool) {
        println!("{}", self.render(machine));
    }

    fn to_csv(&self) -> String {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(csv_line(&self.headers));
        lines.extend(self.rows.iter().map(|r| csv_line(r)));
        lines.join("\n")
    }
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Quote a field if it holds a separator, quote or newline.
pub fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    match secs {
        0..=59 => format!("{secs} seconds ago"),
        60..=3599 => format!("{} minutes ago", secs / 60),
        3600..=86_399 => format!("{} hours ago", secs / 3600),
        _ => format!("{} days ago", secs / 86_400),
    }
}

/// Shorten a digest to its scheme and first 12 hex chars.
pub fn short_digest(digest: &str) -> String {
    let head = |s: &str| s.chars().take(12).collect::<String>();
    match digest.split_once(':') {
        Some((scheme, hex)) => format!("{}:{}", scheme, head(hex)),
        None => head(digest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_listing_machine_mode() {
        let mut listing = Listing::new(&["ID", "NAME"]);
        listing.add_row(vec!["1".to_string(), "redis,4".to_string()]);
        assert_eq!(listing.render(true), "ID,NAME\n1,\"redis,4\"");
    }

    #[test]
    fn test_listing_table_mode() {
        let mut listing = Listing::new(&["ID", "NAME"]);
        listing.add_row(vec!["7".to_string(), "ubuntu".to_string()]);
        let out = listing.render(false);
        assert!(out.contains("ID"));
        assert!(out.contains("ubuntu"));
    }

    #[test]
    fn test_short_digest() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        assert_eq!(short_digest(&digest), "sha256:abababababab");
        assert_eq!(short_digest("abc"), "abc");
        assert_eq!(short_digest("sha256:ééééééééééééé"), "sha256:éééééééééééé");
        assert_eq!(short_digest("日本語のダイジェストです長い"), "日本語のダイジェストです");
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert!(format_ago(&now).ends_with("seconds ago"));
        let earlier = now - chrono::Duration::hours(3);
        assert_eq!(format_ago(&earlier), "3 hours ago");
    }
}
