//! Outbound client scanning.
//!
//! One outbound connection at a time: the scanner walks the peer table in
//! insertion order, dials each addressed entry, and stays parked on an
//! established link until it closes before moving on. An exhausted pass
//! reports back to the core (that is what arms the solo fallback) and the
//! next pass starts after the retry pause.

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use super::{Event, LinkCtx, LinkDirection, link};

pub(crate) async fn scan_loop(connector: TlsConnector, server_name: ServerName<'static>, ctx: LinkCtx) {
    loop {
        let targets = {
            let (tx, rx) = oneshot::channel();
            if ctx
                .event_tx
                .send(Event::DialTargets { reply: tx })
                .await
                .is_err()
            {
                return;
            }
            match rx.await {
                Ok(targets) => targets,
                Err(_) => return,
            }
        };

        let mut connected = false;
        for (name, addr) in targets {
            if dial_and_run(&connector, &server_name, &name, &addr, &ctx).await {
                connected = true;
            }
        }

        if ctx
            .event_tx
            .send(Event::PassEnded { connected })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(ctx.timing.peer_retry).await;
    }
}

/// Dial one peer and, if the link establishes, run it until it closes.
/// Returns whether a link was established.
async fn dial_and_run(
    connector: &TlsConnector,
    server_name: &ServerName<'static>,
    name: &str,
    addr: &str,
    ctx: &LinkCtx,
) -> bool {
    tracing::debug!(peer = %name, %addr, "dialing peer");
    let tcp = match timeout(ctx.timing.handshake_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            tracing::debug!(peer = %name, %addr, "connect failed: {e}");
            return false;
        }
        Err(_) => {
            tracing::debug!(peer = %name, %addr, "connect timed out");
            return false;
        }
    };
    let stream = match timeout(
        ctx.timing.handshake_timeout,
        connector.connect(server_name.clone(), tcp),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(peer = %name, %addr, "outbound TLS handshake failed: {e}");
            return false;
        }
        Err(_) => {
            tracing::debug!(peer = %name, %addr, "outbound TLS handshake timed out");
            return false;
        }
    };
    link::run_link(
        stream,
        LinkDirection::Outbound,
        Some(name.to_string()),
        Some(addr.to_string()),
        ctx.clone(),
    )
    .await
}
