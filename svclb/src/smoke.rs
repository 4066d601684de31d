//! One-shot bootstrap: a single service with a single backend, followed by a
//! request through it.

use std::net::Ipv4Addr;
use std::time::Duration;

use svclb_common::{Backend4Key, Backend4Value, BackendId, Protocol, Service4Key, Service4Value};
use tracing::info;

use crate::Result;
use crate::manager::TableManager;
use crate::tables::BpfMap;

/// Registers `backend:port` under `backend_id` and makes it the only backend
/// of `vip:port`, replacing whatever slots the service had before.
pub fn bootstrap<S, B>(
    manager: &mut TableManager<S, B>,
    vip: Ipv4Addr,
    backend: Ipv4Addr,
    port: u16,
    backend_id: BackendId,
) -> Result<()>
where
    S: BpfMap<Service4Key, Service4Value>,
    B: BpfMap<Backend4Key, Backend4Value>,
{
    manager.upsert_backend(
        Backend4Key { id: backend_id },
        Backend4Value::new(backend, port, Protocol::Tcp),
    )?;
    manager.set_backends(vip, port, &[backend_id], 0)?;
    info!(%vip, %backend, port, backend_id, "registered smoke service");
    Ok(())
}

/// Longest response body kept in the summary.
const MAX_BODY_CHARS: usize = 256;

/// Sends `GET http://vip:port/` and returns the status and response body.
pub async fn fetch(vip: Ipv4Addr, port: u16, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()?;
    let response = client.get(format!("http://{vip}:{port}/")).send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok(summarize(status, &body))
}

fn summarize(status: reqwest::StatusCode, body: &str) -> String {
    let body = body.trim_end();
    if body.chars().count() > MAX_BODY_CHARS {
        let kept: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{status}: {kept}...")
    } else {
        format!("{status}: {body}")
    }
}

#[cfg(test)]
mod test {
    use svclb_common::{ConnectTuple, DenyReason, Verdict};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::manager::TableManager;

    const VIP: Ipv4Addr = Ipv4Addr::new(169, 1, 1, 1);
    const BACKEND: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);
    const TCP: u8 = Protocol::Tcp.number();

    fn new_manager() -> TableManager<
        ahash::HashMap<Service4Key, Service4Value>,
        ahash::HashMap<Backend4Key, Backend4Value>,
    > {
        TableManager::new(ahash::HashMap::default(), ahash::HashMap::default())
    }

    #[test]
    fn test_bootstrap_redirects_to_backend() -> crate::Result<()> {
        let mut manager = new_manager();
        bootstrap(&mut manager, VIP, BACKEND, 80, 500)?;

        let master = manager.services()[&Service4Key::master(VIP, 80)];
        assert_eq!(master.count, 2);
        assert_eq!(manager.services()[&Service4Key::new(VIP, 80, 1)].backend_id, 500);

        for entropy in [0, 1, 7, u32::MAX] {
            match manager.resolve(&ConnectTuple::new(VIP, 80, TCP), entropy) {
                Verdict::Redirect(dest) => {
                    assert_eq!(dest.ip(), BACKEND);
                    assert_eq!(dest.port(), 80);
                }
                other => panic!("unexpected verdict {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_bootstrap_replaces_existing_backends() -> crate::Result<()> {
        let mut manager = new_manager();
        for id in [1, 2, 3] {
            manager.upsert_backend(
                Backend4Key { id },
                Backend4Value::new(Ipv4Addr::new(10, 0, 0, id as u8), 80, Protocol::Tcp),
            )?;
        }
        manager.set_backends(VIP, 80, &[1, 2, 3], 0)?;

        bootstrap(&mut manager, VIP, BACKEND, 80, 500)?;
        let master = manager.services()[&Service4Key::master(VIP, 80)];
        assert_eq!(master.count, 2);
        assert_eq!(manager.services()[&Service4Key::new(VIP, 80, 1)].backend_id, 500);
        for slot in 2..4 {
            assert!(!manager.services().contains_key(&Service4Key::new(VIP, 80, slot)));
        }
        assert_eq!(manager.services().len(), 2);
        Ok(())
    }

    #[test]
    fn test_summary_truncates_long_body() {
        let body = "x".repeat(MAX_BODY_CHARS + 10);
        let summary = summarize(reqwest::StatusCode::OK, &body);
        assert_eq!(summary, format!("200 OK: {}...", "x".repeat(MAX_BODY_CHARS)));
    }

    #[test]
    fn test_bootstrap_then_empty_denies() -> crate::Result<()> {
        let mut manager = new_manager();
        bootstrap(&mut manager, VIP, BACKEND, 80, 500)?;
        manager.set_backends(VIP, 80, &[], 0)?;

        assert_eq!(
            manager.resolve(&ConnectTuple::new(VIP, 80, TCP), 3),
            Verdict::Deny(DenyReason::EmptyService)
        );
        Ok(())
    }

    #[test]
    fn test_bootstrap_udp_connect_denied() -> crate::Result<()> {
        let mut manager = new_manager();
        bootstrap(&mut manager, VIP, BACKEND, 80, 500)?;
        let udp = Protocol::Udp.number();
        assert_eq!(
            manager.resolve(&ConnectTuple::new(VIP, 80, udp), 0),
            Verdict::Deny(DenyReason::ProtocolMismatch { backend_id: 500 })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_reads_response_body() -> crate::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await?;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await?;
            Ok::<_, std::io::Error>(())
        });

        let summary = fetch(Ipv4Addr::LOCALHOST, port, Duration::from_secs(5)).await?;
        assert_eq!(summary, "200 OK: hello");
        server
            .await
            .map_err(|e| crate::Error::Other(e.to_string()))??;
        Ok(())
    }
}
