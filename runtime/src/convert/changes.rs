//! Image metadata carried from the source image to the thin image.

use serde_json::json;
use sha2::{Digest, Sha256};
use thinimage_core::error::Result;
use thinimage_core::ImageConfig;

/// Environment variable every thin image carries.
pub const THIN_IMAGE_ENV: &str = "CVMFS_IMAGE";

/// Dockerfile-style changes for `docker import`.
pub fn image_changes(config: &ImageConfig) -> Vec<String> {
    let mut changes = vec![format!("ENV {} true", THIN_IMAGE_ENV)];
    for entry in config.env() {
        let Some((key, value)) = entry.split_once('=') else {
            tracing::debug!(entry = %entry, "Skipping malformed environment entry");
            continue;
        };
        changes.push(format!("ENV {}=\"{}\"", key, value));
    }
    if !config.cmd().is_empty() {
        changes.push(format!("CMD {}", json!(config.cmd())));
    }
    changes
}

/// Image config for a thin image whose only layer is `layer`.
///
/// Keeps the source environment and command and adds the thin marker variable.
pub fn thin_image_config(config: &ImageConfig, layer: &[u8]) -> Result<Vec<u8>> {
    let mut env: Vec<String> = config.env().to_vec();
    env.push(format!("{}=true", THIN_IMAGE_ENV));
    let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(layer)));

    let value = json!({
        "architecture": go_arch(),
        "os": "linux",
        "config": {
            "Env": env,
            "Cmd": config.cmd(),
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": [diff_id],
        },
        "history": [{
            "created": chrono::Utc::now().to_rfc3339(),
            "created_by": "thinimage convert",
        }],
    });
    Ok(serde_json::to_vec(&value)?)
}

fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinimage_core::manifest::ContainerConfig;

    fn config(env: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            config: Some(ContainerConfig {
                env: Some(env.iter().map(|s| s.to_string()).collect()),
                cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            }),
        }
    }

    #[test]
    fn test_changes_without_config() {
        assert_eq!(image_changes(&ImageConfig::default()), vec!["ENV CVMFS_IMAGE true"]);
    }

    #[test]
    fn test_changes_carry_env_and_cmd() {
        let changes = image_changes(&config(
            &["PATH=/usr/bin:/bin", "BROKEN", "A=b=c"],
            &["redis-server", "--port", "6379"],
        ));
        assert_eq!(
            changes,
            vec![
                "ENV CVMFS_IMAGE true",
                "ENV PATH=\"/usr/bin:/bin\"",
                "ENV A=\"b=c\"",
                "CMD [\"redis-server\",\"--port\",\"6379\"]",
            ]
        );
    }

    #[test]
    fn test_thin_image_config() {
        let bytes = thin_image_config(&config(&["A=1"], &["sh"]), b"layer").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["config"]["Env"], json!(["A=1", "CVMFS_IMAGE=true"]));
        assert_eq!(value["config"]["Cmd"], json!(["sh"]));
        let diff_id = value["rootfs"]["diff_ids"][0].as_str().unwrap();
        assert_eq!(diff_id, format!("sha256:{}", hex::encode(Sha256::digest(b"layer"))));
    }
}
