use crate::bus::{self, Bus, Message, Router, Subscription};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not parse the `--mqtt-broker` argument")]
    ParseMqttBroker(#[source] rumqttc::v5::OptionError),
    #[error("could not restore the subscription to `{1}`")]
    Resubscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("disconnected from the MQTT server")]
    MqttDisconnect,
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// How to connect to the MQTT broker.
    ///
    /// The value is expected to be provided as an URL, such as:
    /// `mqtt://location:1883?client_id=hostname` for plain text connection or
    /// `mqtts://location:1883?client_id=hostname` for TLS protected connection.
    #[arg(short = 'm', long, env = "NEOPOOL_BRIDGE_MQTT_BROKER")]
    mqtt_broker: String,

    /// To be provided together with `--mqtt-password` to use password based authentication
    /// with the broker.
    #[arg(short = 'u', long, requires = "mqtt_password")]
    mqtt_user: Option<String>,

    /// To be provided together with `--mqtt-user` to use password based authentication with
    /// the broker.
    #[arg(short = 'p', long, requires = "mqtt_user")]
    mqtt_password: Option<String>,

    /// Interval between keep-alive pings sent to the broker.
    #[arg(long, default_value = "30s")]
    keep_alive: humantime::Duration,

    /// How long to wait before reconnecting after the connection to the broker fails.
    #[arg(long, default_value = "5s")]
    reconnect_delay: humantime::Duration,
}

/// A connection to the broker shared by every subscription of the process.
///
/// The event loop is driven by a background task. Incoming publishes are handed to the
/// [`Router`] and filters are unsubscribed from the broker once nothing is routed to them
/// anymore.
pub struct Connection {
    client: AsyncClient,
    router: Arc<Router>,
    /// Completes with an error once the connection is lost for good.
    pub worker: AbortOnDropHandle<Result<(), Error>>,
}

impl Connection {
    /// Must be called from within a tokio runtime.
    pub fn new(args: &Args) -> Result<Self, Error> {
        let mut mqtt_options =
            MqttOptions::parse_url(&args.mqtt_broker).map_err(Error::ParseMqttBroker)?;
        if let (Some(u), Some(p)) = (args.mqtt_user.as_ref(), args.mqtt_password.as_ref()) {
            mqtt_options.set_credentials(u, p);
        }
        mqtt_options.set_keep_alive(*args.keep_alive);
        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let (router, released) = Router::with_release_notifications();
        let worker = Worker {
            client: client.clone(),
            router: Arc::clone(&router),
            reconnect_delay: *args.reconnect_delay,
        };
        let worker = AbortOnDropHandle::new(tokio::spawn(worker.main_loop(event_loop, released)));
        Ok(Self { client, router, worker })
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = (&e as &dyn std::error::Error), "could not disconnect cleanly");
        }
    }
}

impl Bus for Connection {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, bus::Error> {
        // Route first, so that retained messages sent in response are not lost.
        let subscription = self.router.route(filter);
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| bus::Error::Subscribe(e, filter.to_string()))?;
        Ok(subscription)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), bus::Error> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
            .map_err(|e| bus::Error::Publish(e, topic.to_string()))
    }
}

struct Worker {
    client: AsyncClient,
    router: Arc<Router>,
    reconnect_delay: Duration,
}

impl Worker {
    async fn main_loop(
        self,
        mut event_loop: EventLoop,
        mut released: UnboundedReceiver<String>,
    ) -> Result<(), Error> {
        loop {
            use rumqttc::Outgoing;
            use rumqttc::v5::Event;
            use rumqttc::v5::mqttbytes::v5::Packet;

            let result = tokio::select! {
                r = event_loop.poll() => r,
                Some(filter) = released.recv() => {
                    self.unsubscribe(filter);
                    continue;
                }
            };
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        message = "mqtt connection error, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };
            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    debug!("connected to mqtt");
                    // The session is not persistent, so the broker forgets about our
                    // subscriptions every time we reconnect.
                    for filter in self.router.filters() {
                        self.client
                            .try_subscribe(filter.clone(), QoS::AtLeastOnce)
                            .map_err(|e| Error::Resubscribe(e, filter))?;
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let Ok(topic) = std::str::from_utf8(&publish.topic) else {
                        debug!(topic = ?publish.topic, "ignoring a publish with non-UTF-8 topic");
                        continue;
                    };
                    let message = Message::new(topic, publish.payload.to_vec());
                    let delivered = self.router.dispatch(&message);
                    trace!(topic, delivered, "dispatched a publish");
                }
                Event::Outgoing(Outgoing::Disconnect) => {
                    return Err(Error::MqttDisconnect);
                }
                event @ Event::Incoming(_) | event @ Event::Outgoing(_) => {
                    trace!(?event, "not handled in any way");
                }
            }
        }
    }

    fn unsubscribe(&self, filter: String) {
        // Somebody might have subscribed again in the meantime.
        if self.router.has_filter(&filter) {
            return;
        }
        debug!(%filter, "unsubscribing");
        // The event loop is driven by this very task, so the blocking variant could deadlock.
        if let Err(e) = self.client.try_unsubscribe(filter) {
            warn!(error = (&e as &dyn std::error::Error), "could not unsubscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[derive(clap::Parser)]
    struct Cli {
        #[clap(flatten)]
        connection: Args,
    }

    #[test]
    fn credentials_go_together() {
        assert!(Cli::try_parse_from(["x", "-m", "mqtt://localhost:1883?client_id=t"]).is_ok());
        assert!(Cli::try_parse_from(["x", "-m", "mqtt://h?client_id=t", "-u", "user"]).is_err());
        let cli = Cli::try_parse_from([
            "x",
            "-m",
            "mqtt://h?client_id=t",
            "-u",
            "user",
            "-p",
            "secret",
            "--keep-alive",
            "1m",
        ])
        .unwrap();
        assert_eq!(*cli.connection.keep_alive, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn rejects_malformed_broker_urls() {
        let cli = Cli::try_parse_from(["x", "-m", "not a url"]).unwrap();
        assert!(matches!(Connection::new(&cli.connection), Err(Error::ParseMqttBroker(_))));
    }
}
