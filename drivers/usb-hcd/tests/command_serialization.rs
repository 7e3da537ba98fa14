//! Command ring protocol: one command in flight, completions by TRB address

mod common;

use std::{sync::Arc, thread};

use common::setup;
use usb_hcd::{trb::CompletionCode, trb::TrbType, HcdConfig, HcdError, UsbSpeed};

#[test]
fn test_concurrent_commands_are_serialized() {
    let config = HcdConfig {
        command_ring_size: 16,
        ..HcdConfig::default()
    };
    let (xhc, controller) = setup(config);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                for _ in 0..25 {
                    controller.commands().no_op().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // 100 from the workers plus the one from initialize(); the 16 TRB ring
    // wrapped several times on the way
    assert_eq!(xhc.count_executed(TrbType::NoOpCommand), 101);
    // Never more than one command on the ring at a time
    assert_eq!(xhc.max_commands_per_doorbell(), 1);
    assert!(!controller.commands().is_busy());
}

#[test]
fn test_failed_command_reports_code() {
    let (xhc, controller) = setup(HcdConfig::default());
    xhc.fail_next_command(CompletionCode::NO_SLOTS_AVAILABLE);

    assert_eq!(
        controller.attach_device(1, UsbSpeed::High).unwrap_err(),
        HcdError::CommandFailed {
            code: CompletionCode::NO_SLOTS_AVAILABLE
        }
    );
    assert_eq!(controller.slots().assigned(), 0);
}

#[test]
fn test_failed_address_device_releases_slot() {
    let (xhc, controller) = setup(HcdConfig::default());
    let first = controller.attach_device(1, UsbSpeed::High).unwrap();
    assert_eq!(first.slot_id(), 1);

    xhc.fail_command(TrbType::AddressDevice, CompletionCode::USB_TRANSACTION_ERROR);
    assert_eq!(
        controller.attach_device(2, UsbSpeed::High).unwrap_err(),
        HcdError::CommandFailed {
            code: CompletionCode::USB_TRANSACTION_ERROR
        }
    );
    assert_eq!(controller.slots().assigned(), 1);
    assert!(controller.slots().device(2).is_none());
    assert_eq!(xhc.count_executed(TrbType::DisableSlot), 1);
}

#[test]
fn test_command_timeout_without_controller_response() {
    let config = HcdConfig {
        command_timeout_ms: 20,
        ..HcdConfig::default()
    };
    let (xhc, controller) = setup(config);

    xhc.pause();
    assert!(matches!(
        controller.commands().no_op(),
        Err(HcdError::Timeout { .. })
    ));

    // The late completion is ignored and the ring keeps working
    xhc.resume();
    assert!(!controller.commands().is_busy());
    controller.commands().no_op().unwrap();
}

#[test]
fn test_slots_are_handed_out_and_returned() {
    let (xhc, controller) = setup(HcdConfig::default());
    let devices: Vec<_> = (1..=3)
        .map(|port| controller.attach_device(port, UsbSpeed::High).unwrap())
        .collect();
    assert_eq!(
        devices.iter().map(|device| device.slot_id()).collect::<Vec<_>>(),
        [1, 2, 3]
    );
    assert_eq!(controller.slots().assigned(), 3);

    controller.detach_device(&devices[1]).unwrap();
    assert!(controller.slots().device(2).is_none());
    assert_eq!(controller.slots().dcbaa_entry(2), 0);
    assert_eq!(xhc.count_executed(TrbType::DisableSlot), 1);
    assert!(!xhc.endpoint_enabled(2, 1));
    assert!(xhc.endpoint_enabled(3, 1));
}
