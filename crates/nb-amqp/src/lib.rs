//! AMQP Connection Supervision
//!
//! Owns the process-shared broker connection and channel:
//! - lazy open on first use
//! - health checks that invalidate dead handles
//! - best-effort reset
//! - cooperative outage mode with level-triggered enter/exit callbacks

use lapin::{options::BasicQosOptions, Channel, Connection, ConnectionProperties};
use nb_config::BrokerConfig;
use parking_lot::RwLock as SyncRwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub mod topology;

type EnterCallback = Box<dyn Fn(Duration) + Send + Sync>;
type ExitCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct OutageCallbacks {
    on_enter: Option<EnterCallback>,
    on_exit: Option<ExitCallback>,
}

/// Supervises a single shared connection + channel pair.
///
/// Lifecycle: created lazily, invalidated on fault, recreated on the
/// next [`ConnectionSupervisor::get_channel`]. Only the consumer's
/// dispatch task mutates the slots; any concurrent holder of a cloned
/// channel observes a closed handle after a reset and must re-resolve.
pub struct ConnectionSupervisor {
    config: BrokerConfig,
    connection: Arc<RwLock<Option<Connection>>>,
    channel: Arc<RwLock<Option<Channel>>>,
    prefetch_count: u16,
    in_outage: AtomicBool,
    callbacks: SyncRwLock<OutageCallbacks>,
}

impl ConnectionSupervisor {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            connection: Arc::new(RwLock::new(None)),
            channel: Arc::new(RwLock::new(None)),
            prefetch_count: 1,
            in_outage: AtomicBool::new(false),
            callbacks: SyncRwLock::new(OutageCallbacks::default()),
        }
    }

    /// Prefetch applied to newly opened channels. Default 1: deliveries
    /// are handled strictly one at a time.
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Register outage callbacks; each fires at most once per
    /// contiguous outage interval.
    pub fn set_outage_callbacks(
        &self,
        on_enter: Option<EnterCallback>,
        on_exit: Option<ExitCallback>,
    ) {
        let mut callbacks = self.callbacks.write();
        callbacks.on_enter = on_enter;
        callbacks.on_exit = on_exit;
    }

    pub fn is_in_outage(&self) -> bool {
        self.in_outage.load(Ordering::SeqCst)
    }

    /// The live channel, opening connection and channel if needed.
    /// Propagates the underlying open error.
    pub async fn get_channel(&self) -> Result<Channel, lapin::Error> {
        if let Some(channel) = self.channel.read().await.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        self.open().await
    }

    async fn open(&self) -> Result<Channel, lapin::Error> {
        debug!(host = %self.config.host, port = self.config.port, "Connecting to AMQP broker");

        let connection = Connection::connect(
            &self.config.uri(),
            ConnectionProperties::default()
                .with_connection_name(self.config.service_name().into()),
        )
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel.clone());

        info!(service = %self.config.service_name(), "Connected to AMQP broker");
        Ok(channel)
    }

    /// True iff the shared connection and channel are both live. Any
    /// failure clears the shared slots so the next call reopens.
    pub async fn is_connection_healthy(&self) -> bool {
        let healthy = {
            let connection = self.connection.read().await;
            let channel = self.channel.read().await;
            match (connection.as_ref(), channel.as_ref()) {
                (Some(connection), Some(channel)) => {
                    connection.status().connected() && channel.status().connected()
                }
                _ => false,
            }
        };

        if !healthy {
            *self.channel.write().await = None;
            *self.connection.write().await = None;
        }
        healthy
    }

    /// Best-effort close of channel then connection; clears the shared
    /// slots. Idempotent, never fails.
    pub async fn reset(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close(200, "reset").await;
        }
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "reset").await;
        }
        debug!("Connection supervisor reset");
    }

    /// Return true when a live connection is available (reconnecting if
    /// needed). Otherwise enter outage mode, sleep, and return false.
    ///
    /// The outage flag is level-triggered: one enter callback per
    /// contiguous outage, one exit callback on recovery.
    pub async fn ensure_connection_or_sleep(&self, sleep: Duration) -> bool {
        let connected = match self.is_connection_healthy().await {
            true => true,
            false => match self.open().await {
                Ok(_) => true,
                Err(e) => {
                    debug!(error = %e, "Reconnect probe failed");
                    false
                }
            },
        };

        if connected {
            if self.in_outage.swap(false, Ordering::SeqCst) {
                info!("Broker connection restored, leaving outage mode");
                if let Some(on_exit) = self.callbacks.read().on_exit.as_ref() {
                    on_exit();
                }
            }
            return true;
        }

        if !self.in_outage.swap(true, Ordering::SeqCst) {
            warn!(
                sleep_s = sleep.as_secs_f64(),
                "Broker unreachable, entering outage mode"
            );
            if let Some(on_enter) = self.callbacks.read().on_enter.as_ref() {
                on_enter(sleep);
            }
        }

        tokio::time::sleep(sleep).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unreachable_config() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "guest".to_string(),
            pass: "guest".to_string(),
            project: "test".to_string(),
            consumer_id: "svc".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_channel_propagates_open_error() {
        let supervisor = ConnectionSupervisor::new(unreachable_config());
        assert!(supervisor.get_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_outage_enter_fires_once_per_outage() {
        let supervisor = Arc::new(ConnectionSupervisor::new(unreachable_config()));
        let enters = Arc::new(AtomicUsize::new(0));

        let counter = enters.clone();
        supervisor.set_outage_callbacks(
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );

        let sleep = Duration::from_millis(5);
        assert!(!supervisor.ensure_connection_or_sleep(sleep).await);
        assert!(supervisor.is_in_outage());
        assert!(!supervisor.ensure_connection_or_sleep(sleep).await);
        assert!(!supervisor.ensure_connection_or_sleep(sleep).await);

        // Level-triggered: one enter for the whole contiguous outage.
        assert_eq!(enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_without_connection() {
        let supervisor = ConnectionSupervisor::new(unreachable_config());
        assert!(!supervisor.is_connection_healthy().await);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let supervisor = ConnectionSupervisor::new(unreachable_config());
        supervisor.reset().await;
        supervisor.reset().await;
        assert!(!supervisor.is_in_outage());
    }
}
