//! Scripted mesh-core scenarios driven against the in-memory `testing` fakes.
//!
//! Two `CoreState` instances are booted side by side and bridged by a task
//! that stands in for the BLE fabric: every `bt_write` one side records is
//! replayed to the other as a `HandleValueNotification`, acknowledged back as
//! a `DataTransmitted`, so the real cluster-merge handshake runs end to end
//! without touching hardware. Requires the `testing` feature:
//!
//! ```text
//! cargo run --bin sim-harness --features testing
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mesh_core::{BleAddress, ConnHandle, DeviceType, JoinMePayload, NodeId, RadioEvent, RebootReason};
use mesh_node::config::RecordStoreConfig;
use mesh_node::testing::{FakeFlash, FakeRadio};
use mesh_node::{CoreConfig, CoreState, RecordStore};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Two freshly-booted nodes connect and converge on one cluster.
    Merge,
    /// A record survives a simulated power cycle of the flash pages backing it.
    RecordReboot,
}

#[derive(Parser, Debug)]
#[command(about = "Drives scripted mesh-core scenarios against in-memory radio/flash fakes")]
struct Args {
    /// Scenario to run. Runs every scenario in sequence if omitted.
    #[arg(value_enum)]
    scenario: Option<Scenario>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let scenarios = match args.scenario {
        Some(s) => vec![s],
        None => vec![Scenario::Merge, Scenario::RecordReboot],
    };

    let mut all_passed = true;
    for scenario in scenarios {
        let passed = match scenario {
            Scenario::Merge => run_merge_scenario().await,
            Scenario::RecordReboot => run_record_reboot_scenario(),
        };
        info!(?scenario, passed, "scenario finished");
        all_passed &= passed;
    }

    if !all_passed {
        eprintln!("one or more scenarios failed");
        std::process::exit(1);
    }
}

/// Boots node A (a `Node`) and node B (a `Sink`), wires a connection between
/// them directly (skipping discovery, which is exercised by `Discovery`'s own
/// unit tests), and drives the resulting cluster-merge handshake through a
/// bridge task until both sides advertise the same `cluster_id`/`cluster_size`.
async fn run_merge_scenario() -> bool {
    let mut config = CoreConfig::default();
    config.timer_tick = Duration::from_millis(20);
    config.clustering.max_time_until_decision = Duration::from_millis(50);

    let radio_a = Arc::new(FakeRadio::new());
    let radio_b = Arc::new(FakeRadio::new());
    let flash_a = Arc::new(FakeFlash::new());
    let flash_b = Arc::new(FakeFlash::new());

    let (radio_tx_a, radio_rx_a) = mpsc::unbounded_channel();
    let (radio_tx_b, radio_rx_b) = mpsc::unbounded_channel();
    let (_flash_tx_a, flash_rx_a) = mpsc::unbounded_channel();
    let (_flash_tx_b, flash_rx_b) = mpsc::unbounded_channel();

    let addr_a = BleAddress([1; 6]);
    let addr_b = BleAddress([2; 6]);
    let handle = ConnHandle(1);

    let core_a = CoreState::boot(
        config,
        NodeId(1),
        DeviceType::Node,
        RebootReason::Unknown,
        radio_a.clone(),
        flash_a,
        radio_rx_a,
        flash_rx_a,
    )
    .await
    .expect("node a boots");

    let core_b = CoreState::boot(
        config,
        NodeId(2),
        DeviceType::Sink,
        RebootReason::Unknown,
        radio_b.clone(),
        flash_b,
        radio_rx_b,
        flash_rx_b,
    )
    .await
    .expect("node b boots");

    let (shutdown_tx_a, shutdown_rx_a) = oneshot::channel::<()>();
    let (shutdown_tx_b, shutdown_rx_b) = oneshot::channel::<()>();
    let task_a = tokio::spawn(core_a.run(Box::pin(async move {
        let _ = shutdown_rx_a.await;
    })));
    let task_b = tokio::spawn(core_b.run(Box::pin(async move {
        let _ = shutdown_rx_b.await;
    })));

    // Hand both sides a freshly radio-connected link; the handshake starts
    // from there the same way it would after a real `bt_connect` resolves.
    let _ = radio_tx_a.send(RadioEvent::Connected { handle, peer_addr: addr_b });
    let _ = radio_tx_b.send(RadioEvent::Connected { handle, peer_addr: addr_a });

    let bridge = tokio::spawn(bridge_radios(radio_a.clone(), radio_b.clone(), radio_tx_a.clone(), radio_tx_b.clone(), handle));

    tokio::time::sleep(Duration::from_millis(800)).await;
    bridge.abort();
    let _ = shutdown_tx_a.send(());
    let _ = shutdown_tx_b.send(());
    let _ = task_a.await;
    let _ = task_b.await;

    let merged = match (radio_a.last_adv_payload(), radio_b.last_adv_payload()) {
        (Some(pa), Some(pb)) => match (JoinMePayload::decode(&pa[..]), JoinMePayload::decode(&pb[..])) {
            (Ok(ja), Ok(jb)) => {
                info!(?ja, ?jb, "post-handshake advertised cluster state");
                ja.cluster_id == jb.cluster_id && ja.cluster_size == 2 && jb.cluster_size == 2
            }
            _ => false,
        },
        _ => false,
    };
    merged
}

/// Replays writes recorded against one radio as notifications on the other,
/// acknowledging each as `DataTransmitted` so the sender's queue keeps
/// draining. Never terminates on its own; the caller aborts it.
async fn bridge_radios(
    radio_a: Arc<FakeRadio>,
    radio_b: Arc<FakeRadio>,
    radio_tx_a: mpsc::UnboundedSender<RadioEvent>,
    radio_tx_b: mpsc::UnboundedSender<RadioEvent>,
    handle: ConnHandle,
) {
    let mut seen_a = 0usize;
    let mut seen_b = 0usize;
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        seen_a = relay_writes(&radio_a, seen_a, &radio_tx_b, &radio_tx_a, handle);
        seen_b = relay_writes(&radio_b, seen_b, &radio_tx_a, &radio_tx_b, handle);
    }
}

fn relay_writes(
    from: &FakeRadio,
    already_seen: usize,
    to_peer: &mpsc::UnboundedSender<RadioEvent>,
    back_to_sender: &mpsc::UnboundedSender<RadioEvent>,
    handle: ConnHandle,
) -> usize {
    let calls = from.write_calls();
    for (_, char_handle, data, reliable) in calls.iter().skip(already_seen) {
        let _ = to_peer.send(RadioEvent::HandleValueNotification {
            handle,
            char_handle: *char_handle,
            data: data.clone(),
        });
        let _ = back_to_sender.send(RadioEvent::DataTransmitted {
            handle,
            unreliable_count: if *reliable { 0 } else { 1 },
            reliable_count: if *reliable { 1 } else { 0 },
        });
    }
    calls.len()
}

/// Saves a record, snapshots the flash pages it landed on, then rebuilds a
/// fresh `RecordStore` from that snapshot the way `RecordStore::repair_on_boot`
/// would after a real power cycle, and checks the record is still there.
fn run_record_reboot_scenario() -> bool {
    let config = RecordStoreConfig::default();
    let flash = FakeFlash::new();
    let mut store = RecordStore::new_erased(config);

    store.save_record(7, &[1, 2, 3, 4], None).expect("queue accepts save");
    drain(&mut store, &flash);

    let snapshot = store.snapshot_pages();
    drop(store);

    let mut rebooted = RecordStore::repair_on_boot(config, snapshot);
    let survived = rebooted.get_record(7) == Some(&[1, 2, 3, 4][..]);
    info!(survived, "record-store contents after simulated reboot");
    survived
}

fn drain(store: &mut RecordStore, flash: &FakeFlash) {
    store.pump(flash);
    while let Some(event) = flash.pop_event() {
        store.on_flash_event(event, flash);
    }
}
