// Copyright (c) 2022-2023 The MobileCoin Foundation

//! File selection and file metadata definitions

use strum::{Display, EnumIter, EnumString, EnumVariantNames};

use crate::access::WriteAccessLevel;

/// Navigation control for select file commands
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum SelectFileControl {
    /// First EF of the current DF
    FirstEf,
    /// Next EF of the current DF
    NextEf,
    /// The current DF
    CurrentDf,
}

/// Select file target, either a LID or a navigation control
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SelectTarget {
    Lid(u16),
    Control(SelectFileControl),
}

/// Data object tags for get data commands
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum GetDataTag {
    /// File control parameters of the current file
    FcpForCurrentFile,
    /// File control information of the current DF
    FciForCurrentDf,
    /// List of EFs in the current DF
    EfList,
    /// Card traceability information
    TraceabilityInformation,
}

/// Elementary file structure
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum FileType {
    Linear,
    Binary,
    Cyclic,
    Counters,
    SimulatedCounters,
}

/// EF header as returned by select file or get data
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileHeader {
    /// Long identifier
    pub lid: u16,
    pub file_type: FileType,
    /// Record size (or file size for binary EFs)
    pub record_size: u16,
    pub records_number: u8,
    pub access_conditions: [u8; 4],
    pub key_indexes: [u8; 4],
    pub df_status: u8,
    /// LID of the shared file, if this EF is shared
    pub shared_reference: Option<u16>,
}

impl FileHeader {
    /// Create a new header with cleared access conditions
    pub fn new(lid: u16, file_type: FileType, record_size: u16, records_number: u8) -> Self {
        Self {
            lid,
            file_type,
            record_size,
            records_number,
            access_conditions: [0u8; 4],
            key_indexes: [0u8; 4],
            df_status: 0,
            shared_reference: None,
        }
    }

    /// Check whether this EF is shared with another DF
    pub fn is_shared(&self) -> bool {
        self.shared_reference.is_some()
    }
}

/// DF header as returned by select file or get data
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DirectoryHeader {
    pub lid: u16,
    pub access_conditions: [u8; 4],
    pub key_indexes: [u8; 4],
    pub df_status: u8,
    /// Session key identifiers, indexed by access level
    pub kif: [u8; 3],
    /// Session key versions, indexed by access level
    pub kvc: [u8; 3],
}

impl DirectoryHeader {
    /// Session key identifier for the provided access level
    pub fn kif(&self, level: WriteAccessLevel) -> u8 {
        self.kif[level.key_index() as usize - 1]
    }

    /// Session key version for the provided access level
    pub fn kvc(&self, level: WriteAccessLevel) -> u8 {
        self.kvc[level.key_index() as usize - 1]
    }
}
