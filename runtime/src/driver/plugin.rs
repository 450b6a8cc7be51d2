//! Docker graph-driver plugin protocol.
//!
//! Only the JSON request/response bodies live here. Socket framing belongs to
//! whatever serves the handler.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thinimage_core::config::ThinConfig;
use thinimage_core::error::{Result, ThinError};

use super::{ChangeKind, UnionMountDriver, DRIVER_NAME};

/// Content type the engine expects on plugin responses.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitRequest {
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub opts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub mount_label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdRequest {
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParentRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub parent: String,
}

impl ParentRequest {
    pub fn parent(&self) -> Option<&str> {
        Some(self.parent.as_str()).filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeEntry {
    pub path: String,
    pub kind: u8,
}

fn kind_code(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Modify => 0,
        ChangeKind::Add => 1,
        ChangeKind::Delete => 2,
    }
}

fn err_body(e: &ThinError) -> Value {
    json!({ "Err": e.to_string() })
}

/// Maps plugin method calls onto a driver.
///
/// The driver is built by `GraphDriver.Init`. Calls before that fail.
pub struct PluginHandler {
    config: ThinConfig,
    driver: RwLock<Option<Arc<UnionMountDriver>>>,
}

impl PluginHandler {
    pub fn new(config: ThinConfig) -> Self {
        Self {
            config,
            driver: RwLock::new(None),
        }
    }

    /// Handler around a driver that is already initialised.
    pub fn with_driver(config: ThinConfig, driver: Arc<UnionMountDriver>) -> Self {
        Self {
            config,
            driver: RwLock::new(Some(driver)),
        }
    }

    fn driver(&self) -> Result<Arc<UnionMountDriver>> {
        self.driver
            .read()
            .clone()
            .ok_or_else(|| ThinError::Driver("driver is not initialised".to_string()))
    }

    /// Dispatch a JSON method call. Failures are reported in the `Err` field.
    pub fn handle(&self, method: &str, body: &[u8]) -> Value {
        tracing::debug!(method = %method, "Plugin call");
        match self.dispatch(method, body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(method = %method, error = %e, "Plugin call failed");
                err_body(&e)
            }
        }
    }

    fn dispatch(&self, method: &str, body: &[u8]) -> Result<Value> {
        match method {
            "Plugin.Activate" => Ok(json!({ "Implements": ["GraphDriver"] })),
            "GraphDriver.Init" => {
                let req: InitRequest = parse(body)?;
                let home = Some(PathBuf::from(&req.home)).filter(|h| !h.as_os_str().is_empty());
                let driver = UnionMountDriver::init(&self.config, home.as_deref(), &req.opts)?;
                *self.driver.write() = Some(Arc::new(driver));
                Ok(ok())
            }
            "GraphDriver.Create" => {
                let req: CreateRequest = parse(body)?;
                self.driver()?.create(&req.id, non_empty(&req.parent))?;
                Ok(ok())
            }
            "GraphDriver.CreateReadWrite" => {
                let req: CreateRequest = parse(body)?;
                self.driver()?
                    .create_read_write(&req.id, non_empty(&req.parent))?;
                Ok(ok())
            }
            "GraphDriver.Remove" => {
                let req: IdRequest = parse(body)?;
                self.driver()?.remove(&req.id)?;
                Ok(ok())
            }
            "GraphDriver.Get" => {
                let req: IdRequest = parse(body)?;
                let dir = self.driver()?.get(&req.id)?;
                Ok(json!({ "Dir": dir.display().to_string(), "Err": "" }))
            }
            "GraphDriver.Put" => {
                let req: IdRequest = parse(body)?;
                self.driver()?.put(&req.id)?;
                Ok(ok())
            }
            "GraphDriver.Exists" => {
                let req: IdRequest = parse(body)?;
                Ok(json!({ "Exists": self.driver()?.exists(&req.id) }))
            }
            "GraphDriver.Status" => {
                let status = self.driver()?.status()?;
                Ok(json!({ "Status": status.pairs() }))
            }
            "GraphDriver.GetMetadata" => {
                let req: IdRequest = parse(body)?;
                let metadata: HashMap<String, String> = self.driver()?.get_metadata(&req.id)?;
                Ok(json!({ "Metadata": metadata, "Err": "" }))
            }
            "GraphDriver.Cleanup" => {
                self.driver()?.cleanup()?;
                Ok(ok())
            }
            "GraphDriver.Changes" => {
                let req: ParentRequest = parse(body)?;
                let changes: Vec<ChangeEntry> = self
                    .driver()?
                    .changes(&req.id, req.parent())?
                    .into_iter()
                    .map(|c| ChangeEntry {
                        path: c.path,
                        kind: kind_code(c.kind),
                    })
                    .collect();
                Ok(json!({ "Changes": changes, "Err": "" }))
            }
            "GraphDriver.DiffSize" => {
                let req: ParentRequest = parse(body)?;
                let size = self.driver()?.diff_size(&req.id, req.parent())?;
                Ok(json!({ "Size": size, "Err": "" }))
            }
            "GraphDriver.Capabilities" => Ok(json!({
                "Capabilities": { "ReproducesExactDiffs": false }
            })),
            "GraphDriver.Diff" | "GraphDriver.ApplyDiff" => Err(ThinError::Driver(format!(
                "{} is a streaming call",
                method
            ))),
            other => Err(ThinError::Driver(format!("unknown method {}", other))),
        }
    }

    /// `GraphDriver.Diff`: write the layer tarball for the request in `body`.
    pub fn diff<W: Write>(&self, body: &[u8], writer: W) -> Result<()> {
        let req: ParentRequest = parse(body)?;
        self.driver()?.diff(&req.id, req.parent(), writer)
    }

    /// `GraphDriver.ApplyDiff`: id and parent come from the query string.
    pub fn apply_diff<R: Read>(&self, id: &str, parent: &str, reader: R) -> Value {
        let result = self
            .driver()
            .and_then(|d| d.apply_diff(id, non_empty(parent), reader));
        match result {
            Ok(size) => json!({ "Size": size, "Err": "" }),
            Err(e) => {
                tracing::warn!(layer = %id, error = %e, "ApplyDiff failed");
                err_body(&e)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }
}

fn ok() -> Value {
    json!({ "Err": "" })
}

fn non_empty(s: &str) -> Option<&str> {
    Some(s).filter(|s| !s.is_empty())
}

fn parse<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::overlay::testing::FakeUnionMounter;
    use crate::store::manager::testing::FakeMounter;
    use tempfile::TempDir;

    fn handler() -> (TempDir, PluginHandler) {
        let dir = TempDir::new().unwrap();
        let mut config = ThinConfig::default();
        config.driver.root = dir.path().join("driver");
        config.store.root = dir.path().join("cvmfs");
        let driver = UnionMountDriver::new(
            &config,
            Arc::new(FakeUnionMounter::default()),
            Arc::new(FakeMounter::default()),
            None,
        )
        .unwrap();
        (dir, PluginHandler::with_driver(config, Arc::new(driver)))
    }

    #[test]
    fn test_activate() {
        let h = PluginHandler::new(ThinConfig::default());
        assert_eq!(
            h.handle("Plugin.Activate", b"{}"),
            json!({ "Implements": ["GraphDriver"] })
        );
    }

    #[test]
    fn test_calls_before_init_fail() {
        let h = PluginHandler::new(ThinConfig::default());
        let resp = h.handle("GraphDriver.Exists", br#"{"ID":"a"}"#);
        assert!(resp["Err"].as_str().unwrap().contains("not initialised"));
    }

    #[test]
    fn test_create_get_put_remove() {
        let (_dir, h) = handler();
        assert_eq!(h.handle("GraphDriver.Create", br#"{"ID":"base","Parent":""}"#), ok());
        assert_eq!(
            h.handle("GraphDriver.CreateReadWrite", br#"{"ID":"rw","Parent":"base"}"#),
            ok()
        );
        assert_eq!(
            h.handle("GraphDriver.Exists", br#"{"ID":"rw"}"#),
            json!({ "Exists": true })
        );

        let resp = h.handle("GraphDriver.Get", br#"{"ID":"rw","MountLabel":""}"#);
        assert!(resp["Dir"].as_str().unwrap().ends_with("mnt/rw"));
        assert_eq!(resp["Err"], "");

        let busy = h.handle("GraphDriver.Remove", br#"{"ID":"rw"}"#);
        assert!(!busy["Err"].as_str().unwrap().is_empty());

        assert_eq!(h.handle("GraphDriver.Put", br#"{"ID":"rw"}"#), ok());
        assert_eq!(h.handle("GraphDriver.Remove", br#"{"ID":"rw"}"#), ok());
        assert_eq!(
            h.handle("GraphDriver.Exists", br#"{"ID":"rw"}"#),
            json!({ "Exists": false })
        );
    }

    #[test]
    fn test_changes_use_numeric_kinds() {
        let (dir, h) = handler();
        h.handle("GraphDriver.Create", br#"{"ID":"base"}"#);
        h.handle("GraphDriver.Create", br#"{"ID":"leaf","Parent":"base"}"#);
        std::fs::write(dir.path().join("driver/diff/leaf/new"), b"x").unwrap();

        let resp = h.handle("GraphDriver.Changes", br#"{"ID":"leaf","Parent":"base"}"#);
        assert_eq!(resp["Changes"], json!([{ "Path": "/new", "Kind": 1 }]));
    }

    #[test]
    fn test_status_and_metadata() {
        let (_dir, h) = handler();
        h.handle("GraphDriver.Create", br#"{"ID":"base"}"#);
        let status = h.handle("GraphDriver.Status", b"");
        assert_eq!(status["Status"][2], json!(["Dirs", "1"]));
        let meta = h.handle("GraphDriver.GetMetadata", br#"{"ID":"base"}"#);
        assert!(meta["Metadata"]["UpperDir"].as_str().is_some());
    }

    #[test]
    fn test_diff_and_apply_diff_streams() {
        let (dir, h) = handler();
        h.handle("GraphDriver.Create", br#"{"ID":"src"}"#);
        h.handle("GraphDriver.Create", br#"{"ID":"dst"}"#);
        std::fs::write(dir.path().join("driver/diff/src/file"), b"abc").unwrap();

        let mut tarball = Vec::new();
        h.diff(br#"{"ID":"src"}"#, &mut tarball).unwrap();
        let resp = h.apply_diff("dst", "", tarball.as_slice());
        assert_eq!(resp, json!({ "Size": 3, "Err": "" }));
        assert_eq!(
            h.handle("GraphDriver.DiffSize", br#"{"ID":"dst"}"#),
            json!({ "Size": 3, "Err": "" })
        );
    }

    #[test]
    fn test_unknown_and_streaming_methods() {
        let (_dir, h) = handler();
        assert!(h.handle("GraphDriver.Bogus", b"{}")["Err"]
            .as_str()
            .unwrap()
            .contains("unknown method"));
        assert!(h.handle("GraphDriver.Diff", b"{}")["Err"]
            .as_str()
            .unwrap()
            .contains("streaming"));
    }

    #[test]
    fn test_bad_json_is_an_error_body() {
        let (_dir, h) = handler();
        let resp = h.handle("GraphDriver.Get", b"{not json");
        assert!(!resp["Err"].as_str().unwrap().is_empty());
    }
}
