// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Raw exchange framing for simulated APDUs
//!
//! Requests are encoded as `CLA INS P1 P2 [Lc data]`, responses as `data SW1 SW2`.
//! Bodies follow the field order of the typed requests and responses.

use byteorder::{BigEndian, ByteOrder};

use calypso_apdu::{
    file::{FileHeader, GetDataTag, SelectFileControl, SelectTarget},
    request::{CardRequest, PinData},
    response::{CardStatus, ResponseData},
    sv::{SvOperation, SvSecurity},
};

const CLA_ISO: u8 = 0x00;
const CLA_CALYPSO: u8 = 0x94;

/// Encode a typed request to raw APDU bytes
pub fn encode_request(req: &CardRequest) -> Vec<u8> {
    use CardRequest::*;

    let (cla, ins, p1, p2, body): (u8, u8, u8, u8, Vec<u8>) = match req {
        SelectFile { target } => match target {
            SelectTarget::Lid(lid) => (CLA_CALYPSO, 0xa4, 0x09, 0x00, lid.to_be_bytes().to_vec()),
            SelectTarget::Control(c) => {
                let p1 = match c {
                    SelectFileControl::FirstEf => 0x02,
                    SelectFileControl::NextEf => 0x02,
                    SelectFileControl::CurrentDf => 0x09,
                };
                let p2 = match c {
                    SelectFileControl::NextEf => 0x02,
                    _ => 0x00,
                };
                (CLA_CALYPSO, 0xa4, p1, p2, vec![0x00, 0x00])
            }
        },
        GetData { tag } => {
            let t: u16 = match tag {
                GetDataTag::FcpForCurrentFile => 0x0062,
                GetDataTag::FciForCurrentDf => 0x006f,
                GetDataTag::EfList => 0x00c0,
                GetDataTag::TraceabilityInformation => 0x0185,
            };
            (CLA_ISO, 0xca, (t >> 8) as u8, t as u8, vec![])
        }
        ReadRecord {
            sfi,
            record_number,
            expected_length,
        } => (
            CLA_CALYPSO,
            0xb2,
            *record_number,
            sfi << 3 | 0x04,
            expected_length.map(|l| vec![l]).unwrap_or_default(),
        ),
        ReadRecords {
            sfi,
            first,
            last,
            record_size,
        } => (
            CLA_CALYPSO,
            0xb2,
            *first,
            sfi << 3 | 0x05,
            vec![*last, *record_size],
        ),
        ReadRecordMultiple {
            sfi,
            first,
            last,
            offset,
            length,
        } => (
            CLA_ISO,
            0xb3,
            *first,
            sfi << 3 | 0x05,
            vec![*last, *offset, *length],
        ),
        ReadBinary {
            sfi,
            offset,
            length,
        } => (
            CLA_ISO,
            0xb0,
            0x80 | sfi,
            *offset as u8,
            vec![(*offset >> 8) as u8, *length],
        ),
        SearchRecordMultiple(s) => {
            let mut b = vec![s.offset, s.repeated_offset as u8, s.fetch_first as u8];
            b.push(s.data.len() as u8);
            b.extend_from_slice(&s.data);
            b.extend_from_slice(&s.mask);
            (CLA_ISO, 0xa2, s.start, s.sfi << 3 | 0x07, b)
        }
        AppendRecord { sfi, data } => (CLA_CALYPSO, 0xe2, 0x00, sfi << 3, data.clone()),
        UpdateRecord {
            sfi,
            record_number,
            data,
        } => (CLA_CALYPSO, 0xdc, *record_number, sfi << 3 | 0x04, data.clone()),
        WriteRecord {
            sfi,
            record_number,
            data,
        } => (CLA_CALYPSO, 0xd2, *record_number, sfi << 3 | 0x04, data.clone()),
        UpdateBinary { sfi, offset, data } => binary(0xd6, *sfi, *offset, data),
        WriteBinary { sfi, offset, data } => binary(0xd0, *sfi, *offset, data),
        Increase {
            sfi,
            counter,
            value,
        } => (CLA_CALYPSO, 0x32, *counter, sfi << 3, u24(*value).to_vec()),
        Decrease {
            sfi,
            counter,
            value,
        } => (CLA_CALYPSO, 0x30, *counter, sfi << 3, u24(*value).to_vec()),
        IncreaseMultiple { sfi, counters } => (CLA_ISO, 0x3a, 0x00, sfi << 3, counters_body(counters)),
        DecreaseMultiple { sfi, counters } => (CLA_ISO, 0x38, 0x00, sfi << 3, counters_body(counters)),
        GetChallenge => (CLA_CALYPSO, 0x84, 0x00, 0x00, vec![]),
        VerifyPin { pin } => (CLA_CALYPSO, 0x20, 0x00, 0x00, pin_body(pin)),
        ChangePin { pin } => (CLA_CALYPSO, 0xd8, 0x00, 0xff, pin_body(pin)),
        ChangeKey {
            key_index,
            ciphered_key,
        } => (CLA_CALYPSO, 0xd8, 0x00, *key_index, ciphered_key.clone()),
        SvGet {
            operation,
            extended_log,
        } => {
            let p2 = match operation {
                SvOperation::Reload => 0x07,
                SvOperation::Debit => 0x09,
            };
            (CLA_CALYPSO, 0x7c, *extended_log as u8, p2, vec![])
        }
        SvReload {
            amount,
            date,
            time,
            free,
            security,
        } => {
            let mut b = date.to_vec();
            b.push(free[0]);
            b.extend_from_slice(&i24(*amount));
            b.push(free[1]);
            b.extend_from_slice(time);
            b.extend(sv_security(security));
            (CLA_CALYPSO, 0xb8, 0x00, 0x00, b)
        }
        SvDebit {
            undo,
            amount,
            date,
            time,
            security,
        } => {
            let mut b = (*amount as i16).to_be_bytes().to_vec();
            b.extend_from_slice(date);
            b.extend_from_slice(time);
            b.extend(sv_security(security));
            let ins = match undo {
                true => 0xbc,
                false => 0xba,
            };
            (CLA_CALYPSO, ins, 0x00, 0x00, b)
        }
        Invalidate => (CLA_CALYPSO, 0x04, 0x00, 0x00, vec![]),
        Rehabilitate => (CLA_CALYPSO, 0x44, 0x00, 0x00, vec![]),
        OpenSecureSession {
            level,
            terminal_challenge,
            read,
            extended,
        } => {
            let (sfi, record_number) = read.unwrap_or((0, 0));
            let p1 = (record_number << 3) | level.key_index() | (*extended as u8) << 7;
            (CLA_CALYPSO, 0x8a, p1, sfi << 3, terminal_challenge.clone())
        }
        ManageSecureSession {
            authenticate,
            encryption,
            terminal_mac,
        } => {
            let p2 = (*authenticate as u8)
                | match encryption {
                    Some(true) => 0x02,
                    Some(false) => 0x04,
                    None => 0x00,
                };
            let body = terminal_mac.clone().unwrap_or_default();
            (CLA_ISO, 0x82, 0x00, p2, body)
        }
        CloseSecureSession {
            terminal_mac,
            ratify_now,
        } => {
            let p1 = match ratify_now {
                true => 0x00,
                false => 0x80,
            };
            (CLA_CALYPSO, 0x8e, p1, 0x00, terminal_mac.clone())
        }
        CancelSecureSession => (CLA_CALYPSO, 0x8e, 0x00, 0x00, vec![]),
        Ratification => (CLA_CALYPSO, 0xb2, 0x00, 0x00, vec![]),
    };

    let mut apdu = vec![cla, ins, p1, p2];
    if !body.is_empty() {
        apdu.push(body.len() as u8);
        apdu.extend(body);
    }
    apdu
}

/// Encode a typed response to raw APDU bytes
pub fn encode_response(status: CardStatus, data: &ResponseData) -> Vec<u8> {
    let mut b = match data {
        ResponseData::None => vec![],
        ResponseData::File { sfi, header } => {
            let mut b = vec![*sfi];
            b.extend(file_header(header));
            b
        }
        ResponseData::Directory(d) => {
            let mut b = d.lid.to_be_bytes().to_vec();
            b.extend_from_slice(&d.access_conditions);
            b.extend_from_slice(&d.key_indexes);
            b.push(d.df_status);
            b.extend_from_slice(&d.kif);
            b.extend_from_slice(&d.kvc);
            b
        }
        ResponseData::EfList(files) => files
            .iter()
            .flat_map(|(sfi, h)| {
                let mut b = vec![*sfi];
                b.extend(file_header(h));
                b
            })
            .collect(),
        ResponseData::Traceability(t) => t.clone(),
        ResponseData::Records(records) => records
            .iter()
            .flat_map(|(n, r)| {
                let mut b = vec![*n, r.len() as u8];
                b.extend_from_slice(r);
                b
            })
            .collect(),
        ResponseData::Binary(d) => d.clone(),
        ResponseData::Search {
            matching,
            first_record,
        } => {
            let mut b = vec![matching.len() as u8];
            b.extend_from_slice(matching);
            if let Some(r) = first_record {
                b.extend_from_slice(r);
            }
            b
        }
        ResponseData::Counters(c) => c
            .iter()
            .flat_map(|(n, v)| {
                let mut b = vec![*n];
                b.extend_from_slice(&u24(*v));
                b
            })
            .collect(),
        ResponseData::Challenge(c) => c.clone(),
        ResponseData::SvStatus(sv) => sv.data.clone(),
        ResponseData::SvSignature(m) => m.clone(),
        ResponseData::SessionOpened(o) => {
            let mut b = o.data.clone();
            if let Some(r) = &o.record {
                b.extend_from_slice(r);
            }
            b
        }
        ResponseData::SessionManaged { card_mac } => card_mac.clone().unwrap_or_default(),
        ResponseData::SessionClosed { card_mac } => card_mac.clone(),
    };

    b.extend_from_slice(&status.sw().to_be_bytes());
    b
}

fn binary(ins: u8, sfi: u8, offset: u16, data: &[u8]) -> (u8, u8, u8, u8, Vec<u8>) {
    let mut b = vec![(offset >> 8) as u8];
    b.extend_from_slice(data);
    (CLA_ISO, ins, 0x80 | sfi, offset as u8, b)
}

fn counters_body(counters: &[(u8, u32)]) -> Vec<u8> {
    counters
        .iter()
        .flat_map(|(n, v)| {
            let mut b = vec![*n];
            b.extend_from_slice(&u24(*v));
            b
        })
        .collect()
}

fn pin_body(pin: &PinData) -> Vec<u8> {
    match pin {
        PinData::Status => vec![],
        PinData::Plain(p) => p.to_vec(),
        PinData::Ciphered(c) => c.clone(),
    }
}

fn sv_security(s: &SvSecurity) -> Vec<u8> {
    let mut b = s.sam_id.to_vec();
    b.extend_from_slice(&s.sam_tnum);
    b.extend_from_slice(&s.terminal_mac);
    b
}

fn file_header(h: &FileHeader) -> Vec<u8> {
    let mut b = h.lid.to_be_bytes().to_vec();
    b.push(h.file_type as u8);
    b.extend_from_slice(&h.record_size.to_be_bytes());
    b.push(h.records_number);
    b.extend_from_slice(&h.access_conditions);
    b.extend_from_slice(&h.key_indexes);
    b.push(h.df_status);
    b.extend_from_slice(&h.shared_reference.unwrap_or(h.lid).to_be_bytes());
    b
}

fn u24(v: u32) -> [u8; 3] {
    let mut b = [0u8; 3];
    BigEndian::write_u24(&mut b, v);
    b
}

fn i24(v: i32) -> [u8; 3] {
    let mut b = [0u8; 3];
    BigEndian::write_i24(&mut b, v);
    b
}
