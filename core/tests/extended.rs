//! Extended mode sessions, early authentication and encryption

use calypso_card_core::{
    apdu::{
        access::{ChannelControl, WriteAccessLevel},
        product::CardFeatures,
    },
    security::SecuritySetting,
    session::SessionState,
    Error, TransactionProfile,
};
use calypso_card_sim::{SimCard, SimSam};

mod helpers;
use helpers::*;

fn extended_card() -> SimCard {
    card().with_features(CardFeatures::EXTENDED_MODE)
}

fn extended_setting() -> SecuritySetting {
    SecuritySetting::new(sam().with_extended_mode())
}

fn encryption_active(sam: Option<&mut SimSam>) -> bool {
    sam.map(|s| s.is_encryption_active()).unwrap_or(false)
}

#[test]
fn extended_mode_support() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    assert!(matches!(
        extended(&mut c, extended_setting()),
        Err(Error::Unsupported(_))
    ));

    let mut c = extended_card();
    assert!(matches!(
        extended(&mut c, setting()),
        Err(Error::Unsupported(_))
    ));

    let mut c = extended_card();
    let t = extended(&mut c, extended_setting())?;
    assert_eq!(t.profile(), TransactionProfile::SecureExtended);

    Ok(())
}

#[test]
fn extended_preparation() -> anyhow::Result<()> {
    init_logging();

    // Regular sessions
    let mut c = extended_card();
    let mut t = secure(&mut c, extended_setting());
    t.prepare_open_secure_session(WriteAccessLevel::Debit)?;
    assert!(matches!(
        t.prepare_early_mutual_authentication(),
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        t.prepare_activate_encryption(),
        Err(Error::Unsupported(_))
    ));

    // No session
    let mut c = extended_card();
    let mut t = extended(&mut c, extended_setting())?;
    assert!(matches!(
        t.prepare_early_mutual_authentication(),
        Err(Error::IllegalState(_))
    ));

    t.prepare_open_secure_session(WriteAccessLevel::Debit)?;
    assert!(matches!(
        t.prepare_deactivate_encryption(),
        Err(Error::IllegalState(_))
    ));

    t.prepare_activate_encryption()?;
    assert!(matches!(
        t.prepare_activate_encryption(),
        Err(Error::IllegalState(_))
    ));
    t.prepare_deactivate_encryption()?;
    assert_eq!(t.pending_commands(), 3);

    Ok(())
}

#[test]
fn early_authentication_with_encryption() -> anyhow::Result<()> {
    init_logging();

    let mut c = extended_card();
    let mut t = extended(&mut c, extended_setting())?;

    t.prepare_open_secure_session(WriteAccessLevel::Debit)?
        .prepare_read_record(SFI_ENV, 1)?
        .prepare_early_mutual_authentication()?
        .prepare_activate_encryption()?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; RECORD_SIZE])?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.session_state(), SessionState::Open);
    assert!(encryption_active(t.crypto_extension::<SimSam>()));

    t.prepare_deactivate_encryption()?
        .prepare_update_record(SFI_CONTRACTS, 2, &[0x02; RECORD_SIZE])?
        .prepare_close_secure_session()?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.session_state(), SessionState::Closed);
    assert!(!encryption_active(t.crypto_extension::<SimSam>()));

    drop(t);
    assert_eq!(
        c.history(),
        &[
            "OpenSecureSession",
            "ManageSecureSession",
            "UpdateRecord",
            "ManageSecureSession",
            "UpdateRecord",
            "CloseSecureSession"
        ]
    );
    assert_eq!(c.record(SFI_CONTRACTS, 2), Some(&[0x02; RECORD_SIZE][..]));

    Ok(())
}

#[test]
fn encryption_ends_with_session() -> anyhow::Result<()> {
    init_logging();

    let mut c = extended_card();
    let mut t = extended(&mut c, extended_setting())?;

    t.prepare_open_secure_session(WriteAccessLevel::Load)?
        .prepare_activate_encryption()?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; RECORD_SIZE])?
        .prepare_close_secure_session()?
        .process_commands(ChannelControl::KeepOpen)?;

    assert!(!encryption_active(t.crypto_extension::<SimSam>()));

    drop(t);
    assert_eq!(
        c.history(),
        &[
            "OpenSecureSession",
            "ManageSecureSession",
            "UpdateRecord",
            "CloseSecureSession"
        ]
    );

    // Also on failure
    let mut c = extended_card();
    let mut t = extended(&mut c, extended_setting())?;
    t.reader_mut().fail_exchange_at(2);

    let r = t
        .prepare_open_secure_session(WriteAccessLevel::Load)?
        .prepare_activate_encryption()?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; RECORD_SIZE])?
        .prepare_close_secure_session()?
        .process_commands(ChannelControl::KeepOpen);

    assert!(matches!(r, Err(Error::CardIo(_))));
    assert!(!encryption_active(t.crypto_extension::<SimSam>()));
    assert_eq!(t.session_state(), SessionState::Closed);

    Ok(())
}

#[test]
fn early_authentication_alone() -> anyhow::Result<()> {
    init_logging();

    let mut c = extended_card();
    let mut t = extended(&mut c, extended_setting())?;

    t.prepare_pre_open_secure_session(WriteAccessLevel::Debit)?
        .prepare_early_mutual_authentication()?
        .prepare_update_record(SFI_CONTRACTS, 3, &[0x03; 8])?
        .prepare_close_secure_session()?
        .process_commands(ChannelControl::KeepOpen)?;

    drop(t);
    assert_eq!(c.record(SFI_CONTRACTS, 3), Some(&[0x03; 8][..]));
    assert!(!c.is_session_open());

    Ok(())
}
