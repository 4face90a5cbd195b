//! Stored value operations

use calypso_card_core::{
    apdu::{
        access::{ChannelControl, WriteAccessLevel},
        sv::{SvAction, SvOperation},
    },
    Error,
};
use calypso_card_sim::SimCard;

mod helpers;
use helpers::*;

const SV_KVC: u8 = 0x79;

fn sv_card(balance: i32) -> SimCard {
    card().with_sv(balance, SV_KVC)
}

#[test]
fn reload() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_sv_get(SvOperation::Reload, SvAction::Do)?
        .prepare_sv_reload_with_data(100, &[0x12, 0x34], &[0x08, 0x00], &[0xaa, 0xbb])?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.card().sv_balance(), Some(1100));
    assert_eq!(t.card().sv_last_tnum(), Some(1));
    assert_eq!(t.card().sv_kvc(), Some(SV_KVC));

    drop(t);
    assert_eq!(c.history(), &["SvGet", "SvReload"]);
    assert_eq!(c.sv_balance(), 1100);
    assert_eq!(c.sv_tnum(), 1);

    // Logged by the card
    let mut t = secure(&mut c, setting());
    t.prepare_sv_read_all_logs()?
        .process_commands(ChannelControl::KeepOpen)?;

    let log = t.card().sv_load_log_record().expect("load log");
    assert_eq!(log.amount(), 100);
    assert_eq!(log.balance(), 1100);
    assert_eq!(log.date(), [0x12, 0x34]);
    assert_eq!(log.free_data(), [0xaa, 0xbb]);
    assert_eq!(log.sv_tnum(), 1);
    assert!(t.card().sv_debit_log_all_records().is_empty());

    Ok(())
}

#[test]
fn debit_and_undo() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .prepare_sv_debit(250)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().sv_balance(), Some(750));

    t.prepare_sv_get(SvOperation::Debit, SvAction::Undo)?
        .prepare_sv_debit(50)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().sv_balance(), Some(800));

    t.prepare_sv_read_all_logs()?
        .process_commands(ChannelControl::KeepOpen)?;
    let logs = t.card().sv_debit_log_all_records();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].balance(), 800);
    assert_eq!(logs[1].amount(), 250);

    drop(t);
    assert_eq!(c.sv_balance(), 800);
    assert_eq!(c.sv_tnum(), 2);

    Ok(())
}

#[test]
fn sv_get_in_previous_batch() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().sv_balance(), Some(1000));

    t.prepare_sv_debit(10)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().sv_balance(), Some(990));

    Ok(())
}

#[test]
fn debit_in_session() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_open_secure_session(WriteAccessLevel::Debit)?
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .prepare_sv_debit(50)?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; 4])?
        .prepare_close_secure_session()?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.card().sv_balance(), Some(950));

    drop(t);
    assert_eq!(
        c.history(),
        &[
            "OpenSecureSession",
            "SvGet",
            "SvDebit",
            "UpdateRecord",
            "CloseSecureSession"
        ]
    );
    assert_eq!(c.sv_balance(), 950);

    Ok(())
}

#[test]
fn one_sv_operation_per_session() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_open_secure_session(WriteAccessLevel::Load)?
        .prepare_sv_get(SvOperation::Reload, SvAction::Do)?
        .prepare_sv_reload(10)?;

    // Not following an SV get
    assert!(matches!(t.prepare_sv_reload(10), Err(Error::IllegalState(_))));

    // Second SV operation in the same session
    t.prepare_sv_get(SvOperation::Reload, SvAction::Do)?;
    assert!(matches!(t.prepare_sv_reload(10), Err(Error::IllegalState(_))));

    // SV operation after another modification
    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    t.prepare_open_secure_session(WriteAccessLevel::Load)?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; 4])?
        .prepare_sv_get(SvOperation::Reload, SvAction::Do)?;
    assert!(matches!(t.prepare_sv_reload(10), Err(Error::IllegalState(_))));

    Ok(())
}

#[test]
fn sv_sequence() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting());

    assert!(matches!(t.prepare_sv_debit(10), Err(Error::IllegalState(_))));

    // Operation mismatch
    t.prepare_sv_get(SvOperation::Reload, SvAction::Do)?;
    assert!(matches!(t.prepare_sv_debit(10), Err(Error::IllegalState(_))));

    t.prepare_sv_reload(10)?
        .process_commands(ChannelControl::KeepOpen)?;

    // The SV get is consumed by the reload
    assert!(matches!(t.prepare_sv_reload(10), Err(Error::IllegalState(_))));

    Ok(())
}

#[test]
fn amount_ranges() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(100_000);
    let mut t = secure(&mut c, setting());

    t.prepare_sv_get(SvOperation::Reload, SvAction::Do)?;
    assert!(matches!(
        t.prepare_sv_reload(8_388_608),
        Err(Error::ArgumentRange { name: "amount", .. })
    ));
    t.prepare_sv_reload(-8_388_608)?;

    t.prepare_sv_get(SvOperation::Debit, SvAction::Do)?;
    assert!(matches!(
        t.prepare_sv_debit(32_768),
        Err(Error::ArgumentRange { .. })
    ));
    assert!(matches!(
        t.prepare_sv_debit(-1),
        Err(Error::ArgumentRange { .. })
    ));

    t.prepare_sv_get(SvOperation::Debit, SvAction::Undo)?;
    t.prepare_sv_debit(32_768)?;

    Ok(())
}

#[test]
fn negative_balance() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(100);
    let mut t = secure(&mut c, setting());

    t.prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert!(matches!(t.prepare_sv_debit(200), Err(Error::IllegalState(_))));

    // Checked on processing when the balance is unknown at preparation
    let r = t
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .prepare_sv_debit(200)?
        .process_commands(ChannelControl::KeepOpen);
    assert!(matches!(r, Err(Error::IllegalState(_))));

    drop(t);
    assert_eq!(c.sv_balance(), 100);

    let mut c = sv_card(100);
    let mut t = secure(&mut c, setting().authorize_sv_negative_balance());

    t.prepare_sv_get(SvOperation::Debit, SvAction::Do)?
        .prepare_sv_debit(200)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().sv_balance(), Some(-100));

    Ok(())
}

#[test]
fn unauthorized_sv_key() -> anyhow::Result<()> {
    init_logging();

    let mut c = sv_card(1000);
    let mut t = secure(&mut c, setting().add_authorized_sv_key(0x00, 0x7a));

    let r = t
        .prepare_sv_get(SvOperation::Reload, SvAction::Do)?
        .prepare_sv_reload(10)?
        .process_commands(ChannelControl::KeepOpen);

    assert_eq!(
        r.err(),
        Some(Error::UnauthorizedKey {
            kif: None,
            kvc: SV_KVC
        })
    );

    drop(t);
    assert_eq!(c.sv_balance(), 1000);

    Ok(())
}

#[test]
fn sv_unavailable() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = secure(&mut c, setting());
    assert!(matches!(
        t.prepare_sv_get(SvOperation::Reload, SvAction::Do),
        Err(Error::Unsupported(_))
    ));

    let mut c = sv_card(1000);
    let mut t = free(&mut c);
    assert!(matches!(
        t.prepare_sv_get(SvOperation::Reload, SvAction::Do),
        Err(Error::Unsupported(_))
    ));

    Ok(())
}
