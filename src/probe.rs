// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A background loop that repeatedly opens a TCP connection to a fixed address.
//!
//! The outcome of each attempt is discarded. The loop shares nothing with the serving path.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::TcpStream, task::JoinHandle, time};

/// `127.0.0.1:9091`.
pub const DEFAULT_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9091);

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the probe loop onto the current runtime. It runs until the handle is aborted or the
/// runtime shuts down.
pub fn spawn(target: SocketAddr, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            attempt(target, interval).await;
            time::sleep(interval).await;
        }
    })
}

/// Makes one connection attempt and drops the result. An unroutable target can hold a connect
/// open far longer than one interval, so the attempt gives up after `interval`.
async fn attempt(target: SocketAddr, interval: Duration) {
    let _ = time::timeout(interval, TcpStream::connect(target)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_repeatedly() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let probe = spawn(listener.local_addr()?, Duration::from_millis(10));

        for _ in 0..3 {
            time::timeout(Duration::from_secs(5), listener.accept()).await??;
        }
        probe.abort();
        Ok(())
    }

    #[tokio::test]
    async fn keeps_running_when_refused() -> anyhow::Result<()> {
        // Bind then drop to find a port with nothing listening.
        let target = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let probe = spawn(target, Duration::from_millis(5));

        time::sleep(Duration::from_millis(50)).await;
        assert!(!probe.is_finished());

        probe.abort();
        assert!(probe.await.unwrap_err().is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn attempts_to_unroutable_targets_give_up_after_one_interval() {
        // Packets to this address are dropped, so a connect would otherwise wait for the OS
        // timeout.
        let unroutable = SocketAddr::from(([10, 255, 255, 1], 9));
        let interval = Duration::from_millis(50);

        let started = time::Instant::now();
        for _ in 0..3 {
            attempt(unroutable, interval).await;
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let probe = spawn(unroutable, interval);
        time::sleep(interval * 5).await;
        assert!(!probe.is_finished());
        probe.abort();
    }
}
