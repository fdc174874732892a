//! Full-duplex byte relay between two connections.

use slog_scope::error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Copy bytes in both directions until both directions finish.
///
/// A clean EOF is propagated as a half-close so the far side can drain and
/// finish. Neither direction's failure interrupts the other: a failed
/// direction is reported under the given protocol label and the surviving
/// copy runs until the peer's close unblocks it. Completion is signaled by
/// returning.
pub async fn relay<L, R>(proxy_type: &str, local: L, remote: R)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = async {
        match tokio::io::copy(&mut local_read, &mut remote_write).await {
            Ok(_) => {
                let _ = remote_write.shutdown().await;
            }
            Err(e) => {
                error!("relay_failed";
                    "proxy_type" => proxy_type.to_string(),
                    "direction" => "upstream",
                    "error" => e.to_string());
            }
        }
    };
    let downstream = async {
        match tokio::io::copy(&mut remote_read, &mut local_write).await {
            Ok(_) => {
                let _ = local_write.shutdown().await;
            }
            Err(e) => {
                error!("relay_failed";
                    "proxy_type" => proxy_type.to_string(),
                    "direction" => "downstream",
                    "error" => e.to_string());
            }
        }
    };

    tokio::join!(upstream, downstream);
}
