//! Process-level scenarios driving the `echo-plugin` binary the way a host does.

#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use plugin_serve::config::{
    DEFAULT_MAGIC_COOKIE_KEY, DEFAULT_MAGIC_COOKIE_VALUE, ENV_UNIX_SOCKET_DIR,
};
use plugin_serve::{CallEnvelope, HandshakeRecord, NetworkType, PluginClient, VERSION};

fn echo_plugin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_echo-plugin"));
    cmd.env(DEFAULT_MAGIC_COOKIE_KEY, DEFAULT_MAGIC_COOKIE_VALUE)
        .env("PLUGIN_LOG", "info")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn read_handshake(child: &mut Child) -> anyhow::Result<HandshakeRecord> {
    let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout"))?;
    let mut line = String::new();
    tokio::time::timeout(
        Duration::from_secs(10),
        BufReader::new(stdout).read_line(&mut line),
    )
    .await??;
    Ok(HandshakeRecord::parse(&line)?)
}

async fn wait_exit(child: &mut Child) -> anyhow::Result<i32> {
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait()).await??;
    status
        .code()
        .ok_or_else(|| anyhow::anyhow!("terminated by signal: {status:?}"))
}

fn send_signal(child: &Child, signal: Signal) -> anyhow::Result<()> {
    let pid = child.id().ok_or_else(|| anyhow::anyhow!("child already exited"))?;
    kill(Pid::from_raw(pid as i32), signal)?;
    Ok(())
}

async fn stderr_of(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out
}

#[tokio::test]
async fn echo_roundtrip_then_clean_exit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut child = echo_plugin().env(ENV_UNIX_SOCKET_DIR, dir.path()).spawn()?;

    let record = read_handshake(&mut child).await?;
    assert_eq!(record.core_protocol_version, 1);
    assert_eq!(record.app_protocol_version, 1);
    assert_eq!(record.network, NetworkType::Unix);
    assert_eq!(record.protocol, "jsonframe");
    assert!(record.address.starts_with(dir.path().to_str().unwrap()));
    assert!(record.server_cert.is_none());

    let client = PluginClient::connect(&record).await?;

    let pending = client
        .start_call(CallEnvelope::new(7, "EchoPlugin", "Echo", json!("hello")))
        .await?;
    assert_eq!(pending.id(), 7);
    assert_eq!(pending.wait().await?, json!("hello"));

    let ping = client.call("PluginController", "Ping", json!(null)).await?;
    assert_eq!(ping["version"], VERSION);

    client.close().await?;
    assert_eq!(wait_exit(&mut child).await?, 0);
    Ok(())
}

#[tokio::test]
async fn explicit_shutdown_exits_zero() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut child = echo_plugin().env(ENV_UNIX_SOCKET_DIR, dir.path()).spawn()?;

    let record = read_handshake(&mut child).await?;
    let client = PluginClient::connect(&record).await?;

    let err = client
        .call("EchoPlugin", "Fail", json!({"message": "bad input"}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "execution: bad input");

    client.shutdown().await?;
    assert_eq!(wait_exit(&mut child).await?, 0);
    Ok(())
}

#[tokio::test]
async fn unusable_socket_dir_exits_one_without_handshake() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut child = echo_plugin()
        .env(ENV_UNIX_SOCKET_DIR, dir.path().join("does-not-exist"))
        .spawn()?;

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("no stdout"))?
        .read_to_string(&mut stdout)
        .await?;
    let stderr = stderr_of(&mut child).await;

    assert_eq!(wait_exit(&mut child).await?, 1);
    assert!(stdout.is_empty(), "unexpected handshake: {stdout:?}");
    assert!(stderr.contains("Error serving plugin"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn running_by_hand_is_refused() -> anyhow::Result<()> {
    let mut child = echo_plugin().env_remove(DEFAULT_MAGIC_COOKIE_KEY).spawn()?;

    let stderr = stderr_of(&mut child).await;
    assert_eq!(wait_exit(&mut child).await?, 1);
    assert!(stderr.contains("This binary is a plugin"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn sigterm_stops_a_serving_plugin() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut child = echo_plugin().env(ENV_UNIX_SOCKET_DIR, dir.path()).spawn()?;

    let record = read_handshake(&mut child).await?;
    let client = PluginClient::connect(&record).await?;
    assert_eq!(client.call("EchoPlugin", "Echo", json!("up")).await?, json!("up"));

    send_signal(&child, Signal::SIGTERM)?;
    assert_eq!(wait_exit(&mut child).await?, 0);
    drop(client);
    Ok(())
}

#[tokio::test]
async fn sigint_is_left_to_the_host() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut child = echo_plugin().env(ENV_UNIX_SOCKET_DIR, dir.path()).spawn()?;

    let record = read_handshake(&mut child).await?;
    let client = PluginClient::connect(&record).await?;

    send_signal(&child, Signal::SIGINT)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(child.try_wait()?.is_none(), "SIGINT stopped the plugin");
    assert_eq!(
        client.call("EchoPlugin", "Echo", json!("still here")).await?,
        json!("still here")
    );

    client.shutdown().await?;
    assert_eq!(wait_exit(&mut child).await?, 0);
    Ok(())
}
