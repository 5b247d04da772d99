//! MQTT 5 broker client: connection options, subscriber and publisher loops.
//!
//! The client speaks MQTT 5 over TLS (rustls). Connect properties request a
//! zero session expiry and response/problem information; subscriptions come
//! from the static table in [`crate::protocol::topics`], all at QoS 0.
//!
//! The publisher drains any pending spool records back into the queue before
//! publishing, maps envelope fields onto MQTT 5 publish properties, and on
//! transport error requeues the in-flight message at the head.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, Filter, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use tokio_util::sync::CancellationToken;

use super::messages::{InboundMessage, QueuedPublish};
use crate::config::Config;
use crate::protocol::topics;
use crate::services::BridgeService;

/// Channel capacity for client requests.
const CLIENT_REQUEST_CAP: usize = 64;
/// Property key marking a message that travelled through the spool.
const SPOOLED_PROPERTY: &str = "bridge-spooled";

/// Build the MQTT 5 connection options from the validated config.
pub fn build_mqtt_options(config: &Config) -> Result<MqttOptions> {
    let client_id = format!("mcubridge-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_start(true);

    let mut connect_props = ConnectProperties::new();
    connect_props.session_expiry_interval = Some(0);
    connect_props.request_response_info = Some(1);
    connect_props.request_problem_info = Some(1);
    options.set_connect_properties(connect_props);

    if let (Some(user), Some(pass)) = (&config.mqtt_user, &config.mqtt_pass) {
        options.set_credentials(user, pass);
    }

    if config.mqtt_tls {
        options.set_transport(Transport::tls_with_config(build_tls_config(config)?));
    }

    Ok(options)
}

fn build_tls_config(config: &Config) -> Result<TlsConfiguration> {
    if config.mqtt_tls_insecure {
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        return Ok(TlsConfiguration::Rustls(Arc::new(tls)));
    }

    let cafile = config
        .mqtt_cafile
        .as_ref()
        .context("mqtt_cafile must be set when TLS verification is enabled")?;
    let ca = std::fs::read(cafile)
        .with_context(|| format!("Failed to read mqtt_cafile {cafile}"))?;

    let client_auth = match (&config.mqtt_certfile, &config.mqtt_keyfile) {
        (Some(cert), Some(key)) => {
            let cert_bytes = std::fs::read(cert)
                .with_context(|| format!("Failed to read mqtt_certfile {cert}"))?;
            let key_bytes = std::fs::read(key)
                .with_context(|| format!("Failed to read mqtt_keyfile {key}"))?;
            Some((cert_bytes, key_bytes))
        }
        _ => None,
    };

    Ok(TlsConfiguration::Simple { ca, alpn: None, client_auth })
}

/// Certificate verifier for `mqtt_tls_insecure`: accepts any server
/// certificate. Encryption without authentication.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

/// Create the async client and its event loop.
pub fn create_client(config: &Config) -> Result<(AsyncClient, EventLoop)> {
    let options = build_mqtt_options(config)?;
    Ok(AsyncClient::new(options, CLIENT_REQUEST_CAP))
}

/// Map an envelope onto MQTT 5 publish properties.
fn publish_properties(message: &QueuedPublish) -> PublishProperties {
    PublishProperties {
        payload_format_indicator: message.payload_format_indicator,
        message_expiry_interval: message.message_expiry_interval,
        topic_alias: None,
        response_topic: message.response_topic.clone(),
        correlation_data: message.correlation_data.clone().map(Bytes::from),
        user_properties: message.user_properties.clone(),
        subscription_identifiers: Vec::new(),
        content_type: message.content_type.clone(),
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Subscriber loop: polls the event loop, subscribes on connect and routes
/// inbound publishes to the bridge service.
pub async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    service: Arc<BridgeService>,
    shutdown: CancellationToken,
) {
    let reconnect_delay = Duration::from_secs(service.config.reconnect_delay.max(1));
    let filters: Vec<Filter> = topics::subscription_filters(&service.config.mqtt_topic)
        .into_iter()
        .map(|path| Filter::new(path, QoS::AtMostOnce))
        .collect();

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!(
                    "Connected to MQTT broker {}:{}",
                    service.config.mqtt_host,
                    service.config.mqtt_port
                );
                let client = client.clone();
                let filters = filters.clone();
                // Subscribe from a task: the request channel may be full
                // while we are still draining the event loop.
                tokio::spawn(async move {
                    if let Err(err) = client.subscribe_many(filters).await {
                        log::error!("MQTT subscribe failed: {err}");
                    }
                });
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let properties = publish.properties.as_ref();
                let inbound = InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.clone(),
                    response_topic: properties.and_then(|p| p.response_topic.clone()),
                    correlation_data: properties.and_then(|p| p.correlation_data.clone()),
                };
                service.handle_mqtt_message(&inbound).await;
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("MQTT connection error: {err}; reconnecting in {reconnect_delay:?}");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
    log::info!("MQTT event loop stopped");
}

/// Publisher loop: drains the spool, then publishes queued envelopes.
pub async fn run_publisher(
    client: AsyncClient,
    service: Arc<BridgeService>,
    shutdown: CancellationToken,
) {
    loop {
        drain_spool(&service).await;

        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = service.publish_queue.pop() => message,
        };

        let properties = publish_properties(&message);
        let result = client
            .publish_with_properties(
                message.topic_name.clone(),
                qos_from_u8(message.qos),
                message.retain,
                message.payload.clone(),
                properties,
            )
            .await;

        if let Err(err) = result {
            log::warn!(
                "MQTT publish to {} failed: {err}; requeueing at head",
                message.topic_name
            );
            service.publish_queue.push_front(message);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
    log::info!("MQTT publisher stopped");
}

/// Move pending spool records back into the publish queue, marking them with
/// the `bridge-spooled` user property.
async fn drain_spool(service: &Arc<BridgeService>) {
    let spool = Arc::clone(&service.spool);

    if spool.is_degraded() {
        let spool = Arc::clone(&spool);
        let _ = tokio::task::spawn_blocking(move || spool.try_reactivate()).await;
    }

    loop {
        // Leave headroom: never let replay crowd out fresh publishes.
        let limit = service.publish_queue.limit();
        if limit > 0 && service.publish_queue.len() >= limit / 2 {
            break;
        }

        let spool_handle = Arc::clone(&spool);
        let popped = tokio::task::spawn_blocking(move || spool_handle.pop_next()).await;
        let Ok(Some(mut message)) = popped else { break };

        if !message.user_properties.iter().any(|(k, _)| k == SPOOLED_PROPERTY) {
            message.user_properties.push((SPOOLED_PROPERTY.into(), "1".into()));
        }

        if let Some(dropped) = service.publish_queue.push(message) {
            // Queue saturated mid-drain; put the casualty back on disk.
            let spool_handle = Arc::clone(&spool);
            let _ = tokio::task::spawn_blocking(move || spool_handle.append(&dropped)).await;
            break;
        }

        let mut state = service.state.lock().expect("state lock poisoned");
        state.mqtt_spooled_replayed += 1;
        state.update_spool_snapshot(spool.snapshot());
    }
}
