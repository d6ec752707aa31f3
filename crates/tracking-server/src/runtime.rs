//! Process wiring: brokers, workers, HTTP serving and shutdown.

use crate::app::{router, AppState};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handlers::{EmailDeliveryHandler, ExportDeliveryHandler};
use crate::mail::{HttpMailer, LogMailer, Mailer};
use crate::notifier::DeliveryNotifier;
use event_pipeline::{
    ConsumerConfig, DeadLetterRedriver, DeliveryHandler, EventConsumer, EventPublisher,
    MemoryQueue, QueueBroker, RedisQueue, EMAIL_DLQ, EMAIL_QUEUE, EXPORT_DLQ, EXPORT_QUEUE,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracking_hub::{
    ConnectionRegistry, CrossInstanceBridge, MemoryPubSub, PubSubBroker, RedisPubSub,
};

/// The two brokers an instance talks to.
#[derive(Clone)]
pub struct Brokers {
    pub pubsub: Arc<dyn PubSubBroker>,
    pub queue: Arc<dyn QueueBroker>,
}

impl Brokers {
    /// Redis when a URL is configured, in-process otherwise.
    pub async fn connect(config: &ServerConfig) -> ServerResult<Self> {
        match &config.redis_url {
            Some(url) => {
                let pubsub = RedisPubSub::connect(url).await?;
                let queue = RedisQueue::connect(url, config.consumer_group.clone())
                    .await?
                    .with_claim_idle(config.claim_idle);
                info!(group = %config.consumer_group, "connected to redis");
                Ok(Self {
                    pubsub: Arc::new(pubsub),
                    queue: Arc::new(queue),
                })
            }
            None => {
                warn!("REDIS_URL not set, using in-memory brokers (single instance only)");
                Ok(Self::in_memory())
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            pubsub: Arc::new(MemoryPubSub::new()),
            queue: Arc::new(MemoryQueue::new()),
        }
    }
}

pub fn build_mailer(config: &ServerConfig) -> ServerResult<Arc<dyn Mailer>> {
    match &config.mail_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "using http mail relay");
            Ok(Arc::new(HttpMailer::new(endpoint.clone(), config.mail_api_key.clone())?))
        }
        None => Ok(Arc::new(LogMailer)),
    }
}

/// Everything one instance runs, minus the listener.
pub struct TrackingService {
    config: ServerConfig,
    brokers: Brokers,
    mailer: Arc<dyn Mailer>,
    registry: ConnectionRegistry,
    notifier: DeliveryNotifier,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TrackingService {
    pub fn new(config: ServerConfig, brokers: Brokers, mailer: Arc<dyn Mailer>) -> Self {
        let bridge = CrossInstanceBridge::new(brokers.pubsub.clone(), config.bridge());
        let registry = ConnectionRegistry::new(Some(bridge));
        let publisher = EventPublisher::new(brokers.queue.clone());
        let notifier = DeliveryNotifier::new(registry.clone(), publisher);

        Self {
            config,
            brokers,
            mailer,
            registry,
            notifier,
            workers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn notifier(&self) -> &DeliveryNotifier {
        &self.notifier
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            buffer_capacity: self.config.buffer_capacity,
            heartbeat: self.config.heartbeat(),
        }
    }

    /// Start the email and export consumers.
    pub fn start_workers(&mut self) {
        let email = EmailDeliveryHandler::new(
            self.mailer.clone(),
            self.config.mail_from.clone(),
            self.config.ops_email.clone(),
        );
        let export = ExportDeliveryHandler::new(self.mailer.clone(), self.config.mail_from.clone());

        let email_task = self.spawn_consumer(email, EMAIL_QUEUE, EMAIL_DLQ, "email");
        let export_task = self.spawn_consumer(export, EXPORT_QUEUE, EXPORT_DLQ, "export");
        self.workers.extend([email_task, export_task]);
    }

    fn spawn_consumer<H: DeliveryHandler>(
        &self,
        handler: H,
        source: &str,
        dead_letter: &str,
        role: &str,
    ) -> JoinHandle<()> {
        let consumer_config = ConsumerConfig::new(source, dead_letter)
            .with_consumer_name(format!("{}-{role}", self.config.consumer_name))
            .with_block_timeout(self.config.block_timeout)
            .with_retry(self.config.retry_policy());
        let consumer = EventConsumer::new(self.brokers.queue.clone(), handler, consumer_config);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { consumer.run(cancel).await })
    }

    /// Close every viewer, stop the workers and wait for them.
    pub async fn shutdown(self) {
        self.registry.shutdown().await;
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("tracking service stopped");
    }
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: TcpListener,
    service: TrackingService,
    shutdown: F,
) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(service.app_state());
    let registry = service.registry().clone();

    info!(addr = %listener.local_addr()?, "tracking server listening");

    // Upgraded sockets are not tracked by axum's graceful shutdown, so the
    // registry closes them as soon as the signal arrives.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown signal received");
            registry.shutdown().await;
        })
        .await?;

    service.shutdown().await;
    Ok(())
}

/// Bind, start workers and serve until `shutdown` resolves.
pub async fn serve<F>(config: ServerConfig, shutdown: F) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let brokers = Brokers::connect(&config).await?;
    let mailer = build_mailer(&config)?;
    let listener = TcpListener::bind(config.bind_addr).await?;

    let mut service = TrackingService::new(config, brokers, mailer);
    service.start_workers();
    serve_on(listener, service, shutdown).await
}

/// Move up to `limit` dead letters from `from` back onto `to`.
pub async fn redrive(
    config: &ServerConfig,
    from: &str,
    to: &str,
    limit: usize,
) -> ServerResult<usize> {
    if config.redis_url.is_none() {
        return Err(ServerError::Config("redrive needs REDIS_URL".into()));
    }
    let brokers = Brokers::connect(config).await?;
    let redriver = DeadLetterRedriver::new(brokers.queue)
        .with_consumer_name(format!("{}-redrive", config.consumer_name));
    Ok(redriver.redrive(from, to, limit).await?)
}
