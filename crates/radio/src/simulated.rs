//! Simulated radio link for testing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use rand::Rng;
use tdma_core::{Result, TdmaError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

use crate::transport::Transport;
use crate::LinkConfig;

/// One end of an in-memory duplex link. Each `send_bytes` call is one
/// transmission; the peer receives it whole or, with probability
/// `packet_loss`, not at all.
pub struct SimulatedLink {
    config: LinkConfig,
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    stats: Arc<Mutex<LinkStats>>,
}

#[derive(Debug, Default)]
struct LinkStats {
    packets_sent: u64,
    packets_dropped: u64,
    bytes_sent: u64,
}

impl SimulatedLink {
    pub fn pair(config: LinkConfig) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(1024);
        let (b_tx, a_rx) = mpsc::channel(1024);
        let a = Self {
            config: config.clone(),
            tx: Some(a_tx),
            rx: a_rx,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        };
        let b = Self {
            config,
            tx: Some(b_tx),
            rx: b_rx,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        };
        (a, b)
    }

    async fn simulate_channel(&self, data: &[u8]) -> Result<bool> {
        if data.len() > self.config.mtu {
            return Err(TdmaError::PayloadTooLarge { size: data.len(), max: self.config.mtu });
        }

        if self.config.bandwidth_bps > 0 {
            let transmission_time = Duration::from_secs_f64(
                (data.len() * 8) as f64 / self.config.bandwidth_bps as f64
            );
            sleep(transmission_time).await;
        }
        sleep(self.config.latency).await;

        let drop_packet = {
            let mut rng = rand::rng();
            rng.random::<f32>() < self.config.packet_loss
        };

        let mut stats = self.stats.lock().await;
        if drop_packet {
            stats.packets_dropped += 1;
            debug!("Simulated loss of {} bytes", data.len());
            return Ok(false);
        }
        stats.packets_sent += 1;
        stats.bytes_sent += data.len() as u64;
        Ok(true)
    }

    /// (sent, dropped, bytes sent)
    pub async fn get_stats(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.packets_sent, stats.packets_dropped, stats.bytes_sent)
    }
}

#[async_trait]
impl Transport for SimulatedLink {
    /// The link is wired at construction; connecting only checks that the
    /// peer end is still there.
    async fn connect(&mut self, address: &str) -> Result<()> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => {
                trace!("Simulated link to {} is up", address);
                Ok(())
            }
            Some(_) => Err(TdmaError::ConnectionClosed),
            None => Err(TdmaError::NotConnected),
        }
    }

    async fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.tx.is_none() {
            return Err(TdmaError::NotConnected);
        }
        trace!("Simulating radio transmission of {} bytes", buf.len());
        if !self.simulate_channel(buf).await? {
            return Ok(());
        }
        let tx = self.tx.as_ref().ok_or(TdmaError::NotConnected)?;
        tx.send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| TdmaError::ConnectionClosed)
    }

    async fn receive_bytes(&mut self, wait: Option<Duration>) -> Result<Bytes> {
        let next = match wait {
            Some(d) => timeout(d, self.rx.recv()).await.map_err(|_| TdmaError::Timeout)?,
            None => self.rx.recv().await,
        };
        next.ok_or(TdmaError::ConnectionClosed)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LinkConfig {
        LinkConfig {
            bandwidth_bps: 0,
            latency: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mtu_enforcement() {
        let config = LinkConfig {
            mtu: 100,
            ..fast()
        };
        let (mut a, mut b) = SimulatedLink::pair(config);

        let large_data = vec![0u8; 200];
        let result = a.send_bytes(&large_data).await;
        assert!(matches!(result, Err(TdmaError::PayloadTooLarge { size: 200, max: 100 })));

        let small_data = vec![7u8; 50];
        a.send_bytes(&small_data).await.unwrap();
        let got = b.receive_bytes(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(&got[..], &small_data[..]);
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let config = LinkConfig {
            packet_loss: 1.0,
            ..fast()
        };
        let (mut a, mut b) = SimulatedLink::pair(config);
        for _ in 0..5 {
            a.send_bytes(b"lost").await.unwrap();
        }
        assert_eq!(a.get_stats().await, (0, 5, 0));
        assert!(matches!(
            b.receive_bytes(Some(Duration::from_millis(20))).await,
            Err(TdmaError::Timeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_and_latency_delay_delivery() {
        let config = LinkConfig {
            bandwidth_bps: 800,
            latency: Duration::from_millis(200),
            ..fast()
        };
        let (mut a, _b) = SimulatedLink::pair(config);
        let start = tokio::time::Instant::now();
        // 100 bytes at 800 bps = 1 s on air
        a.send_bytes(&[0u8; 100]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn disconnect_closes_the_peer() {
        let (mut a, mut b) = SimulatedLink::pair(fast());
        a.connect("hub").await.unwrap();
        a.disconnect().await.unwrap();

        assert!(matches!(b.receive_bytes(None).await, Err(TdmaError::ConnectionClosed)));
        assert!(matches!(b.connect("station").await, Err(TdmaError::ConnectionClosed)));
        assert!(matches!(a.send_bytes(b"x").await, Err(TdmaError::NotConnected)));
    }
}
