//! Handling of the `init` call.
//!
//! Without a bundle the call is a no-op: the application is expected to be
//! started by the container entrypoint. With a bundle, the archive is
//! unpacked into the application directory and the launch command is
//! recorded; the process itself starts on the first `run`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info};

use crate::archive;
use crate::error::{ProxyError, ProxyResult};
use crate::invocation::{InitParams, InitReply};
use crate::state::ProxyState;
use crate::supervisor::AppLaunchSpec;

/// Handle one `init` call.
///
/// The launch slot is claimed before anything is unpacked, so of two
/// concurrent bundle inits only one touches the application directory.
pub async fn handle_init(state: &ProxyState, params: InitParams) -> ProxyResult<InitReply> {
    metrics::counter!("action_proxy_inits_total").increment(1);

    if !params.has_bundle() {
        debug!("init without bundle, application assumed to be running");
        return Ok(InitReply::OK);
    }

    state.reserve_launch()?;
    match install(state, &params).await {
        Ok(spec) => {
            info!(cmd = %spec.cmd, args = ?spec.args, "application bundle installed");
            state.record_launch(spec);
            Ok(InitReply::OK)
        }
        Err(e) => {
            state.release_launch();
            Err(e)
        }
    }
}

async fn install(state: &ProxyState, params: &InitParams) -> ProxyResult<AppLaunchSpec> {
    let main = params.main.as_deref().unwrap_or_default();
    let spec = AppLaunchSpec::parse(state.app_dir(), main)?.with_env(params.env_vars());

    let code = params.code.as_deref().unwrap_or_default();
    let bundle = STANDARD
        .decode(code.trim())
        .map_err(|e| ProxyError::extraction(format!("bundle is not valid base64: {e}")))?;

    archive::extract(bundle, state.app_dir()).await?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;

    use super::*;
    use crate::config::SidecarConfig;

    fn bundle(files: &[(&str, &str)]) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            for (path, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_size(content.len() as u64);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append(&header, content.as_bytes()).unwrap();
            }
            builder.finish().unwrap();
        }
        STANDARD.encode(encoder.finish().unwrap())
    }

    fn state_in(dir: &std::path::Path) -> ProxyState {
        let config = SidecarConfig::builder().app_dir(dir).build().unwrap();
        ProxyState::new(&config).unwrap()
    }

    fn params(value: serde_json::Value) -> InitParams {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_init_without_bundle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(&dir.path().join("app"));

        let reply = handle_init(&state, params(json!({}))).await.unwrap();

        assert_eq!(reply, InitReply::OK);
        assert!(state.launch_spec().is_none());
        assert!(!dir.path().join("app").exists());
    }

    #[tokio::test]
    async fn test_init_with_source_code_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let reply = handle_init(
            &state,
            params(json!({"binary": false, "code": "function main() {}", "main": "main"})),
        )
        .await
        .unwrap();

        assert!(reply.ok);
        assert!(state.launch_spec().is_none());
    }

    #[tokio::test]
    async fn test_init_extracts_and_records_launch() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        let state = state_in(&app_dir);

        let code = bundle(&[("server.js", "require('http')")]);
        handle_init(
            &state,
            params(json!({
                "binary": true,
                "code": code,
                "main": "node server.js",
                "env": {"PORT": "3000"}
            })),
        )
        .await
        .unwrap();

        assert!(app_dir.join("server.js").exists());
        let spec = state.launch_spec().unwrap();
        assert_eq!(spec.dir, app_dir);
        assert_eq!(spec.cmd, "node");
        assert_eq!(spec.args, vec!["server.js"]);
        assert_eq!(spec.env, vec![("PORT".to_string(), "3000".to_string())]);
    }

    #[tokio::test]
    async fn test_second_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let value = json!({"binary": true, "code": bundle(&[("a", "b")]), "main": "./a"});

        handle_init(&state, params(value.clone())).await.unwrap();
        let err = handle_init(&state, params(value)).await.unwrap_err();

        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_concurrent_inits_unpack_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let first = json!({"binary": true, "code": bundle(&[("first", "1")]), "main": "./first"});
        let second = json!({"binary": true, "code": bundle(&[("second", "2")]), "main": "./second"});

        let (a, b) = tokio::join!(
            handle_init(&state, params(first)),
            handle_init(&state, params(second)),
        );

        let statuses: Vec<u16> = [a, b]
            .iter()
            .map(|result| match result {
                Ok(_) => 200,
                Err(e) => e.status_code(),
            })
            .collect();
        assert!(statuses.contains(&200));
        assert!(statuses.contains(&403));
        let unpacked = ["first", "second"].map(|name| dir.path().join(name).exists());
        assert_eq!(unpacked.iter().filter(|&&exists| exists).count(), 1);
    }

    #[tokio::test]
    async fn test_bundle_after_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let config = state.proxy_config();

        // A run without a bundle already started the readiness race
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            state.ensure_ready(&config),
        )
        .await;

        let err = handle_init(
            &state,
            params(json!({"binary": true, "code": bundle(&[("a", "b")]), "main": "./a"})),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status_code(), 403);
        assert!(!dir.path().join("a").exists());
        assert!(state.launch_spec().is_none());
    }

    #[tokio::test]
    async fn test_failed_init_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        handle_init(
            &state,
            params(json!({"binary": true, "code": "not base64!", "main": "./a"})),
        )
        .await
        .unwrap_err();

        handle_init(
            &state,
            params(json!({"binary": true, "code": bundle(&[("a", "b")]), "main": "./a"})),
        )
        .await
        .unwrap();
        assert!(state.launch_spec().is_some());
    }

    #[tokio::test]
    async fn test_bad_base64_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let err = handle_init(
            &state,
            params(json!({"binary": true, "code": "not base64!", "main": "./a"})),
        )
        .await
        .unwrap_err();

        assert_eq!(err.category(), "extraction");
        assert!(state.launch_spec().is_none());
    }

    #[tokio::test]
    async fn test_missing_main_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let err = handle_init(
            &state,
            params(json!({"binary": true, "code": bundle(&[("a", "b")])})),
        )
        .await
        .unwrap_err();

        assert_eq!(err.category(), "config");
    }
}
