//! Newline-delimited JSON bridge to an engine process
//!
//! Request:  `{"id": 3, "method": "execute", "params": {...}}`
//! Reply:    `{"id": 3, "result": ...}` or `{"id": 3, "error": "message"}`
//!
//! One request is in flight at a time; the bridge answers in order.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::{AcousticSolver, EngineLauncher, GradientEngine, SolverSettings};
use crate::acquisition::{Acquisition, Point3, Shot};
use crate::config::{ENGINE_BRIDGE_PATH, ENGINE_EXIT_TIMEOUT};
use crate::fwi::Traces;

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Spawns one bridge process per shot: `<program> -i <xml> -x <x> -y <y> [extra args]`
#[derive(Debug, Clone)]
pub struct BridgeLauncher {
    pub program: PathBuf,
    pub x_partition: usize,
    pub y_partition: usize,
    pub extra_args: Vec<String>,
}

impl BridgeLauncher {
    /// Launcher for the bridge shipped with an engine installation
    pub fn for_installation(geosx: &Path, x_partition: usize, y_partition: usize) -> Self {
        Self {
            program: geosx.join(ENGINE_BRIDGE_PATH),
            x_partition,
            y_partition,
            extra_args: Vec::new(),
        }
    }

    fn args(&self, xml: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            xml.display().to_string(),
            "-x".to_string(),
            self.x_partition.to_string(),
            "-y".to_string(),
            self.y_partition.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl EngineLauncher for BridgeLauncher {
    type Engine = EngineProcess;

    async fn launch(&self, settings: &SolverSettings) -> Result<EngineProcess> {
        EngineProcess::spawn(&self.program, &self.args(&settings.xml), settings.clone())
    }
}

/// A running engine bridge
pub struct EngineProcess {
    child: Child,
    /// Closed at finalize; the bridge exits on end of input
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    settings: SolverSettings,
    next_id: u64,
    exit_timeout: Duration,
}

impl EngineProcess {
    pub fn spawn(program: &Path, args: &[String], settings: SolverSettings) -> Result<Self> {
        debug!("Spawning engine bridge: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start engine bridge {}", program.display()))?;

        let stdin = child
            .stdin
            .take()
            .context("Engine bridge stdin unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("Engine bridge stdout unavailable")?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            settings,
            next_id: 0,
            exit_timeout: ENGINE_EXIT_TIMEOUT,
        })
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let Some(stdin) = self.stdin.as_mut() else {
            bail!("Engine bridge already finalized, cannot send '{}'", method);
        };
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))
        .context("Failed to encode engine request")?;
        line.push('\n');

        stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to send '{}' to engine bridge", method))?;
        stdin
            .flush()
            .await
            .context("Failed to flush engine bridge input")?;

        let reply = self
            .stdout
            .next_line()
            .await
            .context("Failed to read engine bridge reply")?
            .ok_or_else(|| anyhow!("Engine bridge exited during '{}'", method))?;

        let reply: BridgeReply = serde_json::from_str(&reply)
            .with_context(|| format!("Malformed engine bridge reply: {}", reply))?;

        if reply.id != id {
            bail!(
                "Engine bridge replied to request {} while {} ('{}') was pending",
                reply.id,
                id,
                method
            );
        }
        if let Some(error) = reply.error {
            bail!("Engine '{}' failed: {}", method, error);
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl AcousticSolver for EngineProcess {
    async fn initialize(&mut self, rank: usize) -> Result<()> {
        let params = json!({
            "rank": rank,
            "xml": self.settings.xml,
            "dt": self.settings.dt,
            "max_time": self.settings.max_time,
            "dt_seismo_trace": self.settings.dt_seismo_trace,
        });
        self.call("initialize", params).await.map(drop)
    }

    async fn update_outputs_name(&mut self, names: &[String], backward: bool) -> Result<()> {
        self.call(
            "updateOutputsName",
            json!({"names": names, "backward": backward}),
        )
        .await
        .map(drop)
    }

    async fn update_sources_and_receivers(
        &mut self,
        sources: &[Point3],
        receivers: Option<&[Point3]>,
    ) -> Result<()> {
        self.call(
            "updateSourceAndReceivers",
            json!({"sources": sources, "receivers": receivers}),
        )
        .await
        .map(drop)
    }

    async fn update_source_value(&mut self, values: &Traces) -> Result<()> {
        self.call("updateSourceValue", json!({"values": values}))
            .await
            .map(drop)
    }

    async fn apply_initial_conditions(&mut self) -> Result<()> {
        self.call("apply_initial_conditions", json!({}))
            .await
            .map(drop)
    }

    async fn execute(&mut self, time: f64, cycle: usize, output_wavefield: bool) -> Result<()> {
        self.call(
            "execute",
            json!({"time": time, "cycle": cycle, "output_wavefield": output_wavefield}),
        )
        .await
        .map(drop)
    }

    async fn get_pressure_at_receivers(&mut self) -> Result<Traces> {
        let result = self.call("getPressureAtReceivers", json!({})).await?;
        let channels: Vec<Vec<f64>> =
            serde_json::from_value(result).context("Malformed receiver pressure from engine")?;
        Traces::new(self.settings.dt_seismo_trace, channels)
    }

    async fn finalize(&mut self) -> Result<()> {
        self.call("finalize", json!({})).await?;
        drop(self.stdin.take());

        match tokio::time::timeout(self.exit_timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for engine bridge")?;
                if !status.success() {
                    warn!("Engine bridge exited with {}", status);
                }
            }
            Err(_) => {
                warn!(
                    "Engine bridge still running {:?} after finalize, killing it",
                    self.exit_timeout
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill engine bridge: {}", e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GradientEngine for EngineProcess {
    async fn compute_partial_gradient(&mut self, grad_dir: &Path, shot: &Shot) -> Result<()> {
        self.call(
            "computePartialGradient",
            json!({"dir": grad_dir, "shot_id": shot.id}),
        )
        .await
        .map(drop)
    }

    async fn compute_full_gradient(
        &mut self,
        grad_dir: &Path,
        acquisition: &Acquisition,
    ) -> Result<()> {
        let shot_ids: Vec<&str> = acquisition.shots.iter().map(|s| s.id.as_str()).collect();
        self.call(
            "computeFullGradient",
            json!({"dir": grad_dir, "shot_ids": shot_ids}),
        )
        .await
        .map(drop)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write an executable shell script acting as a bridge
    async fn script(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("bridge.sh");
        tokio::fs::write(&path, format!("#!/bin/sh\n{}\n", body))
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    fn settings() -> SolverSettings {
        SolverSettings {
            xml: PathBuf::from("shot.xml"),
            dt: 0.001,
            max_time: 1.0,
            dt_seismo_trace: 0.25,
        }
    }

    // Echoes the request id back with a fixed result
    const ECHO: &str = r#"while read -r line; do
  id=$(echo "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  echo "{\"id\":$id,\"result\":[[1.0,2.0],[3.0,4.0]]}"
done"#;

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, ECHO).await;

        let mut engine = EngineProcess::spawn(&program, &[], settings()).unwrap();
        engine.initialize(0).await.unwrap();
        engine.execute(0.0, 0, true).await.unwrap();

        let traces = engine.get_pressure_at_receivers().await.unwrap();
        assert_eq!(traces.dt, 0.25);
        assert_eq!(traces.channels, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        tokio::time::timeout(Duration::from_secs(10), engine.finalize())
            .await
            .expect("bridge did not exit at end of input")
            .unwrap();
        assert!(engine.execute(0.0, 1, false).await.is_err());
    }

    #[tokio::test]
    async fn test_bridge_ignoring_end_of_input_is_killed() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, &format!("{}\nexec sleep 60", ECHO)).await;

        let mut engine = EngineProcess::spawn(&program, &[], settings()).unwrap();
        engine.exit_timeout = Duration::from_millis(200);
        engine.initialize(0).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), engine.finalize())
            .await
            .expect("finalize did not return")
            .unwrap();
        assert!(engine.child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bridge_error_reply() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            r#"while read -r line; do
  id=$(echo "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  echo "{\"id\":$id,\"error\":\"mesh not found\"}"
done"#,
        )
        .await;

        let mut engine = EngineProcess::spawn(&program, &[], settings()).unwrap();
        let err = engine.initialize(0).await.unwrap_err();
        assert!(err.to_string().contains("mesh not found"));
    }

    #[tokio::test]
    async fn test_bridge_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "exit 0").await;

        let mut engine = EngineProcess::spawn(&program, &[], settings()).unwrap();
        assert!(engine.apply_initial_conditions().await.is_err());
    }

    #[test]
    fn test_launcher_arguments() {
        let mut launcher = BridgeLauncher::for_installation(Path::new("/opt/geosx"), 2, 1);
        launcher.extra_args = vec!["--trace".to_string()];

        assert_eq!(launcher.program, PathBuf::from("/opt/geosx/bin/pygeosx_bridge"));
        assert_eq!(
            launcher.args(Path::new("/run/shot_00001.xml")),
            vec!["-i", "/run/shot_00001.xml", "-x", "2", "-y", "1", "--trace"]
        );
    }
}
