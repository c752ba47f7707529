use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tunneld::config::ProxyConfig;
use tunneld::proxy::ProxyEngine;

/// An ephemeral proxy engine running in the background for one test.
pub struct TestProxy {
    engine: Arc<ProxyEngine>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestProxy {
    /// Spawn an engine for the given `(local_host, local_port, remote_host,
    /// remote_port)` rules and wait until every listener is registered.
    pub async fn start(rules: &[(&str, u16, &str, u16)]) -> Self {
        let engine = Arc::new(ProxyEngine::new(proxy_config(rules)));
        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };

        let deadline = time::Instant::now() + Duration::from_secs(5);
        while engine.listener_count() < rules.len() {
            if handle.is_finished() {
                panic!("engine exited before all listeners were registered");
            }
            assert!(
                time::Instant::now() < deadline,
                "timed out waiting for listeners"
            );
            time::sleep(Duration::from_millis(10)).await;
        }

        TestProxy {
            engine,
            handle: Some(handle),
        }
    }

    /// The engine under test.
    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    /// Shut the engine down and wait for a clean exit.
    pub async fn shutdown_and_join(mut self) -> Result<()> {
        self.engine.shutdown();
        let handle = self.handle.take().expect("engine already joined");
        handle.await?
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// Build a [`ProxyConfig`] from rule tuples.
pub fn proxy_config(rules: &[(&str, u16, &str, u16)]) -> ProxyConfig {
    ProxyConfig {
        local_host: rules.iter().map(|r| r.0.to_string()).collect(),
        local_port: rules.iter().map(|r| r.1).collect(),
        remote_host: rules.iter().map(|r| r.2.to_string()).collect(),
        remote_port: rules.iter().map(|r| r.3).collect(),
    }
}

/// Start an echo server on the given loopback port. Each connection is
/// echoed until the peer closes its write side, then closed.
pub async fn echo_server(port: u16) -> JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// Send `payload` through the tunnel at `local_port` and read back the full
/// response until the far side closes.
pub async fn round_trip(local_port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(("127.0.0.1", local_port)).await?;
    let (mut reader, mut writer) = stream.split();

    let write = async {
        writer.write_all(payload).await?;
        writer.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    };
    let read = async {
        let mut response = Vec::new();
        reader.read_to_end(&mut response).await?;
        Ok::<_, anyhow::Error>(response)
    };
    let ((), response) = tokio::try_join!(write, read)?;
    Ok(response)
}
