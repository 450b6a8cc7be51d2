//! `thinimage set-recipe` command.
//!
//! The recipe owns every wish of its user in its repository: missing ones are
//! added, ones the recipe no longer lists are removed.

use std::path::PathBuf;

use clap::Args;
use thinimage_core::{diff_wishes, Recipe, WishSpec};
use thinimage_runtime::ConversionDb;

use super::add_wish::record_wish;
use super::Context;

#[derive(Args)]
pub struct SetRecipeArgs {
    /// YAML recipe file
    pub file: PathBuf,

    /// Print the changes without applying them
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(

    args: SetRecipeArgs,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(&args.file)
        .map_err(|e| format!("Failed to read {}: {}", args.file.display(), e))?;
    let recipe = Recipe::from_yaml(&text)?;
    let desired = recipe.wishes()?;

    let db = ctx.open_db()?;
    let current = current_wishes(db.as_ref(), &recipe)?;
    let (to_add, to_remove) = diff_wishes(&desired, &current);

    for spec in &to_add {
        println!("+ {} -> {}", spec.input, spec.output);
    }
    for (id, spec) in current.iter().filter(|(id, _)| to_remove.contains(id)) {
        println!("- [{}] {} -> {}", id, spec.input, spec.output);
    }
    if args.dry_run {
        return Ok(());
    }

    for spec in &to_add {
        record_wish(db.as_ref(), Some(&recipe.user), spec)?;
    }
    for id in &to_remove {
        db.delete_wish(*id)?;
    }
    println!("Recipe applied: {} added, {} removed", to_add.len(), to_remove.len());
    Ok(())
}

/// Wishes of the recipe's user in the recipe's repository, keyed by id.
fn current_wishes(
    db: &dyn ConversionDb,
    recipe: &Recipe,
) -> thinimage_core::Result<Vec<(u64, WishSpec)>> {
    let mut current = Vec::new();
    for info in db.list_wishes()? {
        if info.repo != recipe.cvmfs_repo {
            continue;
        }
        let input = db.get_image_by_id(info.input_id)?;
        if input.user.as_deref() != Some(recipe.user.as_str()) {
            continue;
        }
        let output = db.get_image_by_id(info.output_id)?;
        current.push((
            info.id,
            WishSpec {
                input: input.reference,
                output: output.reference,
                repo: info.repo,
            },
        ));
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use thinimage_runtime::JsonDatabase;

    const RECIPE: &str = r#"
version: 1
user: alice
cvmfs_repo: images.example.org
output_format: https://registry.example.org/thin/$(image)
input:
  - https://registry.hub.docker.com/library/redis:4
  - https://registry.hub.docker.com/library/ubuntu:22.04
"#;

    #[test]
    fn test_current_wishes_scoped_to_user_and_repo() {
        let dir = TempDir::new().unwrap();
        let db = JsonDatabase::open(dir.path().join("db.json")).unwrap();
        let recipe = Recipe::from_yaml(RECIPE).unwrap();

        let mine = &recipe.wishes().unwrap()[0];
        record_wish(&db, Some("alice"), mine).unwrap();
        let other_repo = WishSpec::parse(
            "https://registry.hub.docker.com/library/redis:4",
            "https://registry.example.org/thin/redis:4",
            "other.example.org",
        )
        .unwrap();
        record_wish(&db, Some("alice"), &other_repo).unwrap();
        let other_user = WishSpec::parse(
            "https://registry.hub.docker.com/library/nginx:1",
            "https://registry.example.org/thin/nginx:1",
            "images.example.org",
        )
        .unwrap();
        record_wish(&db, Some("bob"), &other_user).unwrap();

        let current = current_wishes(&db, &recipe).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(&current[0].1, mine);

        let (to_add, to_remove) = diff_wishes(&recipe.wishes().unwrap(), &current);
        assert_eq!(to_add.len(), 1);
        assert!(to_remove.is_empty());
    }
}
