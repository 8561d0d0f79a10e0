use std::collections::BTreeMap;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serial_dock::{
    commands::{CommandMessage, CommandOutcome},
    device::{Handle, Location},
    error::Error,
    forwarder::ForwarderState,
    mock::AnnounceEvent,
};
use tokio::io::AsyncWriteExt;

mod common;
use common::*;

fn ports<const N: usize>(entries: [(&str, u16); N]) -> BTreeMap<String, u16> {
    entries
        .into_iter()
        .map(|(location, port)| (location.to_string(), port))
        .collect()
}

#[tokio::test]
async fn ports_follow_sorted_locations() -> Result<()> {
    let bench = Bench::new(47300)?;

    bench.scanner.plug("1-2", "/dev/ttyUSB0");
    bench.scanner.plug("1-1", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    let expected = ports([("1-1", 47300), ("1-2", 47301)]);
    assert_eq!(bench.ports().await, expected);
    assert_eq!(bench.port_map(), expected);
    assert_eq!(bench.announcers.published(), vec![47300, 47301]);

    let mut device = bench.opener.take_link("/dev/ttyUSB1").unwrap();
    let mut client = connect(47300).await?;
    device.io.write_all(b"from 1-1").await?;
    assert_eq!(read_exactly(&mut client, 8).await?, b"from 1-1");

    Ok(())
}

#[tokio::test]
async fn unplugged_device_keeps_its_port() -> Result<()> {
    let bench = Bench::new(47310)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.scanner.plug("1-2", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    bench.scanner.unplug("1-1");
    bench.gateway.reconcile().await;

    assert_eq!(bench.ports().await, ports([("1-2", 47311)]));
    assert_eq!(bench.port_map(), ports([("1-1", 47310), ("1-2", 47311)]));
    assert_eq!(bench.announcers.published(), vec![47311]);

    // Back again, same port. A newcomer does not take it.
    bench.scanner.plug("3-1", "/dev/ttyACM0");
    bench.scanner.plug("1-1", "/dev/ttyUSB7");
    bench.gateway.reconcile().await;

    assert_eq!(
        bench.ports().await,
        ports([("1-1", 47310), ("1-2", 47311), ("3-1", 47312)])
    );

    Ok(())
}

#[tokio::test]
async fn reconcile_is_idempotent() -> Result<()> {
    let bench = Bench::new(47320)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    let before = bench.gateway.forwarders().await;

    bench.gateway.reconcile().await;
    bench.gateway.reconcile().await;

    assert_eq!(bench.gateway.forwarders().await, before);
    assert_eq!(bench.opener.opened().len(), 1);
    assert_eq!(bench.announcers.events().len(), 1);

    Ok(())
}

#[tokio::test]
async fn failed_scan_changes_nothing() -> Result<()> {
    let bench = Bench::new(47330)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    bench.scanner.set_failing(true);
    bench.scanner.unplug("1-1");
    bench.gateway.reconcile().await;

    assert_eq!(bench.ports().await, ports([("1-1", 47330)]));

    Ok(())
}

#[tokio::test]
async fn ports_survive_a_restart() -> Result<()> {
    let bench = Bench::new(47340)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.scanner.plug("1-2", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    let bench = bench.restart().await;

    // Enumeration order changed while we were away
    bench.scanner.plug("0-9", "/dev/ttyUSB2");
    bench.gateway.reconcile().await;

    assert_eq!(
        bench.ports().await,
        ports([("0-9", 47342), ("1-1", 47340), ("1-2", 47341)])
    );

    Ok(())
}

#[tokio::test]
async fn shutdown_closes_and_unpublishes_everything() -> Result<()> {
    let bench = Bench::new(47350)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.scanner.plug("1-2", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    let _client = connect(47350).await?;

    bench.gateway.shutdown().await;

    assert!(bench.announcers.published().is_empty());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", 47350))
        .await
        .is_err());

    Ok(())
}

#[tokio::test]
async fn open_failure_is_retried() -> Result<()> {
    let bench = Bench::new(47360)?;

    bench.opener.break_device("/dev/ttyUSB0");
    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    assert!(bench.ports().await.is_empty());
    // The port is reserved all the same
    assert_eq!(bench.port_map(), ports([("1-1", 47360)]));

    bench.opener.heal("/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    assert_eq!(bench.ports().await, ports([("1-1", 47360)]));

    Ok(())
}

#[tokio::test]
async fn vanished_device_is_reopened() -> Result<()> {
    let bench = Bench::new(47370)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    drop(bench.opener.take_link("/dev/ttyUSB0"));

    let gone = &bench;
    eventually("forwarder forgotten", || async move {
        gone.ports().await.is_empty()
    })
    .await?;

    bench.gateway.reconcile().await;

    assert_eq!(bench.ports().await, ports([("1-1", 47370)]));
    assert_eq!(bench.opener.opened().len(), 2);

    Ok(())
}

#[tokio::test]
async fn first_scan_happens_on_start() -> Result<()> {
    let bench = Bench::new(47470)?;

    // No explicit reconcile, and the next periodic scan is an hour away
    bench.scanner.plug("1-1", "/dev/ttyUSB0");

    let started = &bench;
    eventually("device found", || async move {
        started.ports().await == ports([("1-1", 47470)])
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn restart_by_port_and_location() -> Result<()> {
    let bench = Bench::new(47380)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;
    let id = bench.gateway.forwarders().await[0].id;

    let outcome = bench.gateway.command(CommandMessage::restart(47380)).await?;
    assert_eq!(
        outcome,
        CommandOutcome::Restarted {
            location: Location::new("1-1"),
            port: 47380
        }
    );

    let outcome = bench
        .gateway
        .command(CommandMessage::restart_id("1-1"))
        .await?;
    assert!(matches!(outcome, CommandOutcome::Restarted { port: 47380, .. }));

    // Same instance, reopened twice
    let status = &bench.gateway.forwarders().await[0];
    assert_eq!(status.id, id);
    assert_eq!(status.state, ForwarderState::Open);
    assert_eq!(bench.opener.opened().len(), 3);

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn reattach_by_port_and_location() -> Result<()> {
    let bench = Bench::new(47460)?;

    let sys = bench.dir.path().join("sys");
    let driver = sys.join("bus/usb/drivers/ftdi_sio");
    let interface = sys.join("bus/usb/devices/1-1.2:1.0");
    std::fs::create_dir_all(&driver)?;
    std::fs::create_dir_all(&interface)?;
    std::os::unix::fs::symlink(&driver, interface.join("driver"))?;

    bench.scanner.plug("1-1.2:1.0", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    let outcome = bench.gateway.command(CommandMessage::reattach(47460)).await?;
    assert_eq!(
        outcome,
        CommandOutcome::Reattached {
            location: Location::new("1-1.2:1.0")
        }
    );
    assert_eq!(std::fs::read_to_string(driver.join("unbind"))?, "1-1.2:1.0");
    assert_eq!(std::fs::read_to_string(driver.join("bind"))?, "1-1.2:1.0");

    let outcome = bench
        .gateway
        .command(CommandMessage::reattach_id("1-1.2:1.0"))
        .await?;
    assert!(matches!(outcome, CommandOutcome::Reattached { .. }));

    let result = bench
        .gateway
        .command(CommandMessage::reattach_id("9-9"))
        .await;
    assert!(matches!(result, Err(Error::NoSuchForwarder(_))), "{result:?}");

    // Served, but no driver to rebind
    bench.scanner.plug("1-1.3:1.0", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    let result = bench.gateway.command(CommandMessage::reattach(47461)).await;
    assert!(matches!(result, Err(Error::Reattach { .. })), "{result:?}");

    Ok(())
}

#[tokio::test]
async fn restart_picks_up_a_renamed_device() -> Result<()> {
    let bench = Bench::new(47390)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    // Replugged between scans, the kernel gave it a new name
    bench.scanner.plug("1-1", "/dev/ttyUSB3");
    bench.gateway.reconcile().await;

    bench.gateway.command(CommandMessage::restart(47390)).await?;

    assert_eq!(
        bench.opener.opened().last(),
        Some(&(Handle::new("/dev/ttyUSB3"), 115_200))
    );
    assert_eq!(
        bench.gateway.forwarders().await[0].handle,
        Handle::new("/dev/ttyUSB3")
    );

    Ok(())
}

#[tokio::test]
async fn unknown_targets_are_rejected() -> Result<()> {
    let bench = Bench::new(47400)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    let result = bench
        .gateway
        .command(CommandMessage::restart_id("9-9"))
        .await;
    assert!(matches!(result, Err(Error::NoSuchForwarder(_))));

    let result = bench
        .gateway
        .command(CommandMessage::set_baudrate(47499, 9600))
        .await;
    assert!(matches!(result, Err(Error::NoSuchForwarder(_))));

    // Nothing was stored for the unknown port
    assert!(bench.baud_map().is_empty());

    Ok(())
}

#[tokio::test]
async fn malformed_commands_are_rejected() -> Result<()> {
    let bench = Bench::new(47410)?;

    let mut message = CommandMessage::restart(47410);
    message.command = "explode".into();
    let result = bench.gateway.command(message).await;
    assert!(matches!(result, Err(Error::BadCommand(_))));

    let mut message = CommandMessage::set_baudrate(47410, 9600);
    message.value = None;
    let result = bench.gateway.command(message).await;
    assert!(matches!(result, Err(Error::BadCommand(_))));

    // Still alive
    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;
    assert_eq!(bench.ports().await, ports([("1-1", 47410)]));

    Ok(())
}

#[tokio::test]
async fn set_baudrate_persists_and_reopens() -> Result<()> {
    let bench = Bench::new(47420)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.scanner.plug("1-2", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;

    let outcome = bench
        .gateway
        .command(CommandMessage::set_baudrate(47421, 9600))
        .await?;
    assert_eq!(
        outcome,
        CommandOutcome::BaudRateSet {
            port: 47421,
            rate: 9600
        }
    );

    assert_eq!(bench.baud_map(), BTreeMap::from([(47421, 9600)]));
    assert_eq!(
        bench.opener.opened().last(),
        Some(&(Handle::new("/dev/ttyUSB1"), 9600))
    );

    // The override applies to later opens too
    let bench = bench.restart().await;
    bench.gateway.reconcile().await;
    let rates = bench
        .gateway
        .forwarders()
        .await
        .into_iter()
        .map(|status| (status.port, status.baud_rate))
        .collect::<Vec<_>>();
    assert_eq!(rates, vec![(47420, 115_200), (47421, 9600)]);

    // Back to the default clears the entry
    let outcome = bench
        .gateway
        .command(CommandMessage::set_baudrate(47421, 0))
        .await?;
    assert_eq!(
        outcome,
        CommandOutcome::BaudRateSet {
            port: 47421,
            rate: 115_200
        }
    );
    assert!(bench.baud_map().is_empty());

    Ok(())
}

#[tokio::test]
async fn failed_restart_forgets_the_forwarder() -> Result<()> {
    let bench = Bench::new(47430)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    bench.opener.break_device("/dev/ttyUSB0");
    let result = bench.gateway.command(CommandMessage::restart(47430)).await;

    assert!(matches!(result, Err(Error::OpenSerial { .. })));
    assert!(bench.ports().await.is_empty());
    assert!(bench.announcers.published().is_empty());

    bench.opener.heal("/dev/ttyUSB0");
    bench.gateway.reconcile().await;
    assert_eq!(bench.ports().await, ports([("1-1", 47430)]));

    Ok(())
}

#[tokio::test]
async fn cleanup_releases_absent_devices() -> Result<()> {
    let bench = Bench::new(47440)?;

    bench.scanner.plug("1-1", "/dev/ttyUSB0");
    bench.scanner.plug("1-2", "/dev/ttyUSB1");
    bench.gateway.reconcile().await;
    bench
        .gateway
        .command(CommandMessage::set_baudrate(47440, 9600))
        .await?;

    bench.scanner.unplug("1-1");
    bench.gateway.reconcile().await;

    let released = bench.gateway.cleanup().await;

    assert_eq!(released, vec![47440]);
    assert_eq!(bench.port_map(), ports([("1-2", 47441)]));
    assert!(bench.baud_map().is_empty());

    // The freed port goes to the next newcomer
    bench.scanner.plug("2-1", "/dev/ttyUSB2");
    bench.gateway.reconcile().await;
    assert_eq!(
        bench.ports().await,
        ports([("1-2", 47441), ("2-1", 47440)])
    );

    Ok(())
}

#[tokio::test]
async fn announcements_name_the_device() -> Result<()> {
    let bench = Bench::new(47450)?;

    bench.scanner.plug("1-1.4", "/dev/ttyUSB0");
    bench.gateway.reconcile().await;

    assert_eq!(
        bench.announcers.events(),
        vec![AnnounceEvent::Published {
            name: "ttyUSB0 (1-1.4) on bench".into(),
            port: 47450
        }]
    );

    Ok(())
}
