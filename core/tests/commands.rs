//! Command preparation and processing outside secure sessions

use std::collections::BTreeMap;

use calypso_card_core::{
    apdu::{
        access::{ChannelControl, WriteAccessLevel},
        file::{FileType, GetDataTag, SelectFileControl},
        product::ProductType,
        response::CardStatus,
    },
    command::SearchCommandData,
    Error,
};

mod helpers;
use helpers::*;

#[test]
fn fifo_processing() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_select_file(0x2020)?
        .prepare_read_record(SFI_ENV, 1)?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; RECORD_SIZE])?
        .prepare_append_record(SFI_EVENTS, &[0x02; RECORD_SIZE])?;
    assert_eq!(t.pending_commands(), 4);

    t.process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.pending_commands(), 0);

    drop(t);
    assert_eq!(
        c.history(),
        &["SelectFile", "ReadRecord", "UpdateRecord", "AppendRecord"]
    );

    Ok(())
}

#[test]
fn rejected_preparation() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_record(SFI_ENV, 1)?;

    assert!(matches!(
        t.prepare_read_record(31, 1),
        Err(Error::ArgumentRange { name: "sfi", .. })
    ));
    assert!(matches!(
        t.prepare_read_record(SFI_ENV, 0),
        Err(Error::ArgumentRange { .. })
    ));
    assert!(matches!(
        t.prepare_update_record(SFI_CONTRACTS, 1, &[]),
        Err(Error::ArgumentRange { .. })
    ));
    assert!(matches!(
        t.prepare_read_records(SFI_CONTRACTS, 3, 2, 29),
        Err(Error::ArgumentRange { .. })
    ));
    assert_eq!(t.pending_commands(), 1);

    Ok(())
}

#[test]
fn best_effort_reads() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_record(SFI_CONTRACTS, 5)?
        .prepare_read_record(0x1e, 1)?
        .prepare_read_record(SFI_ENV, 1)?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(record(&t, SFI_CONTRACTS, 5), None);
    assert_eq!(record(&t, SFI_ENV, 1), Some(vec![0x11; RECORD_SIZE]));

    Ok(())
}

#[test]
fn read_multiple_records() -> anyhow::Result<()> {
    init_logging();

    // All records in a single exchange
    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_records(SFI_CONTRACTS, 1, 4, RECORD_SIZE as u8)?
        .process_commands(ChannelControl::KeepOpen)?;

    for (n, v) in [(1, 0x31), (2, 0x32), (3, 0x33), (4, 0x34)] {
        assert_eq!(record(&t, SFI_CONTRACTS, n), Some(vec![v; RECORD_SIZE]));
    }
    drop(t);
    assert_eq!(c.history(), &["ReadRecords"]);

    // Limited by the payload capacity
    let mut c = card().with_payload_capacity(64);
    let mut t = free(&mut c);

    t.prepare_read_records(SFI_CONTRACTS, 1, 4, RECORD_SIZE as u8)?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(record(&t, SFI_CONTRACTS, 4), Some(vec![0x34; RECORD_SIZE]));
    drop(t);
    assert_eq!(c.history(), &["ReadRecords"; 2]);

    // Legacy cards read each record separately
    let mut c = sim_card(ProductType::PrimeRevision2);
    let mut t = free(&mut c);

    t.prepare_read_records(SFI_CONTRACTS, 2, 4, RECORD_SIZE as u8)?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(record(&t, SFI_CONTRACTS, 1), None);
    assert_eq!(record(&t, SFI_CONTRACTS, 3), Some(vec![0x33; RECORD_SIZE]));
    drop(t);
    assert_eq!(c.history(), &["ReadRecord"; 3]);

    Ok(())
}

#[test]
fn read_records_partially() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_records_partially(SFI_CONTRACTS, 1, 3, 2, 5)?
        .process_commands(ChannelControl::KeepOpen)?;

    let mut expected = vec![0x00; 2];
    expected.extend_from_slice(&[0x32; 5]);
    assert_eq!(record(&t, SFI_CONTRACTS, 2), Some(expected));
    assert_eq!(record(&t, SFI_CONTRACTS, 4), None);

    // Revision 3 only
    let mut c = sim_card(ProductType::PrimeRevision2);
    let mut t = free(&mut c);
    assert!(matches!(
        t.prepare_read_records_partially(SFI_CONTRACTS, 1, 3, 2, 5),
        Err(Error::Unsupported(_))
    ));

    Ok(())
}

#[test]
fn binary_files() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_binary(SFI_BINARY, 0, BINARY_SIZE as u16)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(record(&t, SFI_BINARY, 1), Some(binary_content()));
    assert_eq!(t.reader().history(), &["ReadBinary"; 3]);

    // Reads stop at the end of the file
    t.reader_mut().clear_history();
    t.prepare_read_binary(SFI_BINARY, 500, 300)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.reader().history(), &["ReadBinary"]);

    // Updates split on the payload capacity
    t.reader_mut().clear_history();
    t.prepare_update_binary(SFI_BINARY, 100, &[0xee; 300])?
        .prepare_write_binary(SFI_BINARY, 0, &[0x80; 2])?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(
        t.reader().history(),
        &["UpdateBinary", "UpdateBinary", "WriteBinary"]
    );

    let mut expected = binary_content();
    expected[100..400].fill(0xee);
    expected[0] |= 0x80;
    expected[1] |= 0x80;
    assert_eq!(record(&t, SFI_BINARY, 1), Some(expected.clone()));

    drop(t);
    assert_eq!(c.record(SFI_BINARY, 1), Some(&expected[..]));

    // Revision 3 only
    let mut c = sim_card(ProductType::PrimeRevision2);
    let mut t = free(&mut c);
    assert!(matches!(
        t.prepare_read_binary(SFI_BINARY, 0, 10),
        Err(Error::Unsupported(_))
    ));

    Ok(())
}

#[test]
fn search_records() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    let search = SearchCommandData::new()
        .set_sfi(SFI_CONTRACTS)
        .set_offset(4)
        .set_search_data(&[0x33, 0x33])
        .fetch_first_matching_result();

    t.prepare_search_records(search)?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.card().search_result(SFI_CONTRACTS), Some(&[3u8][..]));
    assert_eq!(record(&t, SFI_CONTRACTS, 3), Some(vec![0x33; RECORD_SIZE]));

    // Masked search from record 2
    let search = SearchCommandData::new()
        .set_sfi(SFI_CONTRACTS)
        .start_at_record(2)
        .set_search_data(&[0x30])
        .set_mask(&[0xf0]);

    t.prepare_search_records(search)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().search_result(SFI_CONTRACTS), Some(&[2u8, 3, 4][..]));

    assert!(matches!(
        t.prepare_search_records(SearchCommandData::new().set_sfi(SFI_CONTRACTS)),
        Err(Error::ArgumentRange { .. })
    ));

    Ok(())
}

#[test]
fn file_selection() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_select_file(0x2020)?
        .process_commands(ChannelControl::KeepOpen)?;

    let file = t.card().file_by_lid(0x2020).expect("selected file");
    assert_eq!(file.sfi(), SFI_CONTRACTS);
    assert_eq!(file.header().map(|h| h.records_number), Some(4));

    t.prepare_select_file_control(SelectFileControl::CurrentDf)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(t.card().directory_header().map(|d| d.lid), Some(0x2000));

    let r = t
        .prepare_select_file(0x3f99)?
        .process_commands(ChannelControl::KeepOpen);
    assert!(matches!(r, Err(Error::SelectFileNotFound(_))));

    Ok(())
}

#[test]
fn get_data() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_get_data(GetDataTag::EfList)?
        .prepare_get_data(GetDataTag::TraceabilityInformation)?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(t.card().files().count(), 5);
    let binary = t.card().file_by_sfi(SFI_BINARY).and_then(|f| f.header());
    assert_eq!(binary.map(|h| h.file_type), Some(FileType::Binary));
    assert_eq!(t.card().traceability_information(), &[0x00; 8]);

    let mut c = sim_card(ProductType::PrimeRevision2);
    let mut t = free(&mut c);
    assert!(matches!(
        t.prepare_get_data(GetDataTag::EfList),
        Err(Error::Unsupported(_))
    ));

    Ok(())
}

#[test]
fn cyclic_append() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    // Header and content known to the snapshot
    t.prepare_select_file(0x2010)?
        .prepare_read_records(SFI_EVENTS, 1, 3, RECORD_SIZE as u8)?
        .prepare_append_record(SFI_EVENTS, &[0x24; RECORD_SIZE])?
        .process_commands(ChannelControl::KeepOpen)?;

    assert_eq!(record(&t, SFI_EVENTS, 1), Some(vec![0x24; RECORD_SIZE]));
    assert_eq!(record(&t, SFI_EVENTS, 3), Some(vec![0x22; RECORD_SIZE]));
    assert_eq!(record(&t, SFI_EVENTS, 4), None);

    drop(t);
    assert_eq!(c.record(SFI_EVENTS, 2), Some(&[0x21; RECORD_SIZE][..]));
    assert_eq!(c.record(SFI_EVENTS, 4), None);

    Ok(())
}

#[test]
fn counter_limits() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_increase_counter(SFI_COUNTERS, 1, 0xff_ffff)?;
    assert!(matches!(
        t.prepare_increase_counter(SFI_COUNTERS, 1, 0x100_0000),
        Err(Error::ArgumentRange {
            name: "counter value",
            value: 0x100_0000,
            ..
        })
    ));
    assert!(matches!(
        t.prepare_decrease_counters(SFI_COUNTERS, &BTreeMap::new()),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(t.pending_commands(), 1);

    Ok(())
}

#[test]
fn counters() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    t.prepare_read_counter(SFI_COUNTERS, 3)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(counter(&t, 2), Some(20));

    t.prepare_increase_counter(SFI_COUNTERS, 1, 5)?
        .prepare_decrease_counter(SFI_COUNTERS, 2, 20)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(counter(&t, 1), Some(15));
    assert_eq!(counter(&t, 2), Some(0));

    // Multiple counters in one command
    t.reader_mut().clear_history();
    t.prepare_increase_counters(SFI_COUNTERS, &BTreeMap::from([(1, 1), (3, 2)]))?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(counter(&t, 1), Some(16));
    assert_eq!(counter(&t, 3), Some(32));
    assert_eq!(t.reader().history(), &["IncreaseMultiple"]);

    // Set from the known value
    t.reader_mut().clear_history();
    t.prepare_set_counter(SFI_COUNTERS, 3, 30)?
        .prepare_set_counter(SFI_COUNTERS, 1, 16)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(counter(&t, 3), Some(30));
    assert_eq!(t.reader().history(), &["Decrease"]);

    // Underflow rejected by the card
    let r = t
        .prepare_decrease_counter(SFI_COUNTERS, 2, 1)?
        .process_commands(ChannelControl::KeepOpen);
    assert!(matches!(r, Err(Error::UnexpectedCardStatus { .. })));

    drop(t);
    assert_eq!(c.counter(SFI_COUNTERS, 1), Some(16));
    assert_eq!(c.counter(SFI_COUNTERS, 3), Some(30));

    Ok(())
}

#[test]
fn legacy_counters() -> anyhow::Result<()> {
    init_logging();

    let mut c = sim_card(ProductType::PrimeRevision2);
    let mut t = free(&mut c);

    t.prepare_decrease_counters(SFI_COUNTERS, &BTreeMap::from([(1, 1), (2, 2)]))?
        .process_commands(ChannelControl::KeepOpen)?;

    drop(t);
    assert_eq!(c.history(), &["Decrease"; 2]);
    assert_eq!(c.counter(SFI_COUNTERS, 1), Some(9));
    assert_eq!(c.counter(SFI_COUNTERS, 2), Some(18));

    Ok(())
}

#[test]
fn unknown_counter_value() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);

    assert!(matches!(
        t.prepare_set_counter(SFI_COUNTERS, 1, 3),
        Err(Error::IllegalState(_))
    ));

    Ok(())
}

#[test]
fn invalidate_rehabilitate() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = free(&mut c);
    assert!(matches!(t.prepare_invalidate(), Err(Error::Unsupported(_))));

    let mut c = card();
    let mut t = secure(&mut c, setting());

    t.prepare_invalidate()?
        .process_commands(ChannelControl::KeepOpen)?;
    assert!(t.card().is_df_invalidated());
    assert!(t.reader().is_df_invalidated());

    assert!(matches!(t.prepare_invalidate(), Err(Error::IllegalState(_))));

    t.prepare_rehabilitate()?
        .process_commands(ChannelControl::KeepOpen)?;
    assert!(!t.card().is_df_invalidated());
    assert!(!t.reader().is_df_invalidated());

    Ok(())
}

#[test]
fn change_key() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    let mut t = secure(&mut c, setting());

    assert!(matches!(
        t.prepare_change_key(4, 0x30, 0x7a, 0x21, 0x79),
        Err(Error::ArgumentRange { .. })
    ));

    t.prepare_change_key(3, 0x30, 0x7a, 0x21, 0x79)?
        .process_commands(ChannelControl::KeepOpen)?;

    drop(t);
    assert_eq!(c.history(), &["GetChallenge", "ChangeKey"]);
    assert_eq!(c.session_key(WriteAccessLevel::Debit), (0x30, 0x7a));

    // Not within a session
    let mut c = card();
    let mut t = secure(&mut c, setting());
    t.prepare_open_secure_session(WriteAccessLevel::Debit)?;
    assert!(matches!(
        t.prepare_change_key(3, 0x30, 0x7a, 0x21, 0x79),
        Err(Error::IllegalState(_))
    ));

    Ok(())
}

#[test]
fn partial_failure() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    c.fail_exchange_at(2);
    let mut t = free(&mut c);

    let r = t
        .prepare_read_record(SFI_ENV, 1)?
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; RECORD_SIZE])?
        .prepare_update_record(SFI_CONTRACTS, 2, &[0x02; RECORD_SIZE])?
        .prepare_update_record(SFI_CONTRACTS, 3, &[0x03; RECORD_SIZE])?
        .process_commands(ChannelControl::KeepOpen);

    assert!(matches!(r, Err(Error::CardIo(_))));
    assert_eq!(t.pending_commands(), 0);

    // Commands processed before the failure are reflected in the snapshot
    assert_eq!(record(&t, SFI_ENV, 1), Some(vec![0x11; RECORD_SIZE]));
    assert_eq!(record(&t, SFI_CONTRACTS, 1), Some(vec![0x01; RECORD_SIZE]));
    assert_eq!(record(&t, SFI_CONTRACTS, 2), None);
    assert_eq!(record(&t, SFI_CONTRACTS, 3), None);

    drop(t);
    assert_eq!(c.record(SFI_CONTRACTS, 3), Some(&[0x33; RECORD_SIZE][..]));

    Ok(())
}

#[test]
fn failed_command_leaves_no_partial_update() -> anyhow::Result<()> {
    init_logging();

    // Second chunk of a 300 byte update fails
    let mut c = card();
    c.fail_exchange_at(1);
    let mut t = free(&mut c);

    let r = t
        .prepare_update_binary(SFI_BINARY, 0, &[0xee; 300])?
        .process_commands(ChannelControl::KeepOpen);

    assert!(matches!(r, Err(Error::CardIo(_))));
    assert_eq!(record(&t, SFI_BINARY, 1), None);
    drop(t);

    // Second decrease of a legacy multiple counter command fails
    let mut c = sim_card(ProductType::PrimeRevision2);
    c.fail_exchange_at(2);
    let mut t = free(&mut c);

    t.prepare_read_counter(SFI_COUNTERS, 3)?
        .process_commands(ChannelControl::KeepOpen)?;
    assert_eq!(counter(&t, 1), Some(10));

    let r = t
        .prepare_decrease_counters(SFI_COUNTERS, &BTreeMap::from([(1, 1), (2, 2)]))?
        .process_commands(ChannelControl::KeepOpen);

    assert!(matches!(r, Err(Error::CardIo(_))));
    assert_eq!(counter(&t, 1), Some(10));
    assert_eq!(counter(&t, 2), Some(20));

    Ok(())
}

#[test]
fn unexpected_status() -> anyhow::Result<()> {
    init_logging();

    let mut c = card();
    c.fail_command("UpdateRecord", CardStatus::SecurityNotSatisfied);
    let mut t = free(&mut c);

    let r = t
        .prepare_update_record(SFI_CONTRACTS, 1, &[0x01; 4])?
        .process_commands(ChannelControl::KeepOpen);

    assert_eq!(
        r.err(),
        Some(Error::UnexpectedCardStatus {
            command: "UpdateRecord",
            status: CardStatus::SecurityNotSatisfied,
        })
    );
    assert_eq!(record(&t, SFI_CONTRACTS, 1), None);

    Ok(())
}
