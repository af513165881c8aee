use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use distress_relay::actuator::{Actuator, ConsolePanel, ThreadDelay};
use distress_relay::config::DispatchConfig;
use distress_relay::link::{Backoff, Endpoint, LinkEvent, MqttSubscriber};
use distress_relay::logging;

const POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "actuator")]
#[command(about = "Badge simulator: plays alert patterns for commands received over MQTT")]
struct Args {
    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    topic: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut config = DispatchConfig {
        client_prefix: "distress-badge".into(),
        ..DispatchConfig::default()
    };
    if let Some(broker) = args.broker {
        config.broker_host = broker;
    }
    if let Some(port) = args.port {
        config.broker_port = port;
    }
    if let Some(topic) = args.topic {
        config.topic = topic;
    }

    println!("actuator");
    println!("========");
    println!(
        "Broker: {}:{} topic {}",
        config.broker_host, config.broker_port, config.topic
    );
    println!();

    let mut panel = ConsolePanel;
    let mut delay = ThreadDelay;
    let mut actuator = Actuator::boot(&mut panel);

    let backoff = Backoff::from_config(&config);
    let mut subscriber = MqttSubscriber::new(Endpoint::from_config(&config));
    let mut sessions = 0u32;
    let mut failures = 0u32;

    loop {
        if !subscriber.is_connected() {
            match subscriber.connect() {
                Ok(()) => {
                    sessions += 1;
                    failures = 0;
                    log::info!("Subscribed to {}", config.topic);
                    if sessions > 1 {
                        actuator.on_reconnect(&mut panel, &mut delay);
                    }
                }
                Err(err) => {
                    let wait = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    log::warn!("Connect failed: {} (retry in {} ms)", err, wait.as_millis());
                    std::thread::sleep(wait);
                    continue;
                }
            }
        }

        match subscriber.poll(POLL) {
            Some(LinkEvent::Message(payload)) => {
                actuator.receive(&payload, &mut panel, &mut delay);
            }
            Some(LinkEvent::Down(reason)) => {
                log::warn!("Broker connection lost: {} (holding {})", reason, actuator.state());
            }
            Some(LinkEvent::Up) | None => {}
        }
    }
}
