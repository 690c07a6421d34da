//! Chunked BEGIN / DATA* / END transfers.
//!
//! The source is held in memory and its CRC32 computed once. BEGIN carries
//! destination metadata, each DATA carries at most [`MAX_CHUNK_SIZE`] bytes
//! and END carries the whole-file CRC32. Every request is a single exchange;
//! the first failure aborts the transfer and nothing is retried.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{MAX_CHUNK_SIZE, Opcode, crc::crc32, exchange},
    },
    byteorder::{BigEndian, WriteBytesExt},
    log::{debug, info},
    std::{fmt, fs, path::Path},
};

/// Width of the NUL-padded partition name field.
pub const PARTITION_NAME_LEN: usize = 64;

/// Where a transfer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Destination {
    /// Device RAM at an absolute address.
    Ram {
        /// Load address.
        address: u64,
    },
    /// Raw flash at a byte offset.
    Flash {
        /// Flash offset.
        offset: u64,
    },
    /// A named flash partition.
    Partition {
        /// Partition name (at most 64 bytes of UTF-8).
        name: String,
    },
    /// A file on the device's mounted filesystem.
    Filesystem {
        /// Device-side path, e.g. `/SD:/swiftio.bin`.
        path: String,
    },
}

impl Destination {
    /// BEGIN, DATA and END opcodes for this destination.
    pub fn opcodes(&self) -> (Opcode, Opcode, Opcode) {
        match self {
            Self::Ram { .. } => (Opcode::RamBegin, Opcode::RamData, Opcode::RamEnd),
            Self::Flash { .. } => (Opcode::FlashBegin, Opcode::FlashData, Opcode::FlashEnd),
            Self::Partition { .. } => (
                Opcode::PartitionBegin,
                Opcode::PartitionData,
                Opcode::PartitionEnd,
            ),
            Self::Filesystem { .. } => (Opcode::FsBegin, Opcode::FsData, Opcode::FsEnd),
        }
    }

    /// Whether the ROM listener needs a staged agent to reach this destination.
    pub fn needs_agent(&self) -> bool {
        matches!(self, Self::Partition { .. } | Self::Filesystem { .. })
    }

    /// BEGIN payload announcing `length` bytes.
    pub fn begin_payload(&self, length: u32) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Self::Ram { address: base } | Self::Flash { offset: base } => {
                payload.write_u64::<BigEndian>(*base)?;
                payload.write_u32::<BigEndian>(length)?;
            },
            Self::Partition { name } => {
                payload.extend_from_slice(&partition_name(name)?);
                payload.write_u32::<BigEndian>(length)?;
            },
            Self::Filesystem { path } => {
                if path.is_empty() {
                    return Err(Error::InvalidArgument("filesystem path is empty".into()));
                }
                payload.write_u32::<BigEndian>(length)?;
                payload.extend_from_slice(path.as_bytes());
            },
        }
        Ok(payload)
    }

    /// END payload for a source with the given CRC32.
    ///
    /// A resume address is only ever appended for RAM and flash.
    pub fn end_payload(&self, crc: u32, layout: EndLayout) -> Vec<u8> {
        let mut payload = crc.to_be_bytes().to_vec();
        if let (EndLayout::WithResumeAddress(address), Self::Ram { .. } | Self::Flash { .. }) =
            (layout, self)
        {
            payload.extend_from_slice(&address.to_be_bytes());
        }
        payload
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram { address } => write!(f, "RAM @ {address:#010x}"),
            Self::Flash { offset } => write!(f, "flash @ {offset:#010x}"),
            Self::Partition { name } => write!(f, "partition '{name}'"),
            Self::Filesystem { path } => write!(f, "file {path}"),
        }
    }
}

/// Shape of the RAM/flash END payload.
///
/// Bootloader revisions differ on whether END carries a resume address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndLayout {
    /// CRC32 only.
    #[default]
    CrcOnly,
    /// CRC32 followed by an 8-byte resume-execution address.
    WithResumeAddress(u64),
}

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Bytes per DATA request, 1..=65536.
    pub chunk_size: usize,
    /// END payload layout.
    pub end_layout: EndLayout,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            end_layout: EndLayout::CrcOnly,
        }
    }
}

impl TransferOptions {
    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the END layout.
    #[must_use]
    pub fn with_end_layout(mut self, end_layout: EndLayout) -> Self {
        self.end_layout = end_layout;
        self
    }
}

/// What a completed transfer moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    /// Bytes sent in DATA requests.
    pub bytes: usize,
    /// Number of DATA requests.
    pub chunks: usize,
    /// CRC32 of the whole source.
    pub crc: u32,
}

/// Encode a partition name into its fixed 64-byte NUL-padded field.
pub fn partition_name(name: &str) -> Result<[u8; PARTITION_NAME_LEN]> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("partition name is empty".into()));
    }
    if name.len() > PARTITION_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "partition name '{name}' is {} bytes, limit is {PARTITION_NAME_LEN}",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidArgument(
            "partition name contains a NUL byte".into(),
        ));
    }

    let mut field = [0u8; PARTITION_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

/// Move `data` to `destination`.
///
/// `progress` is called with `(bytes_sent, total_bytes)` after every
/// acknowledged DATA request.
pub fn transfer<P, F>(
    port: &mut P,
    destination: &Destination,
    data: &[u8],
    options: &TransferOptions,
    mut progress: F,
) -> Result<TransferSummary>
where
    P: Port + ?Sized,
    F: FnMut(usize, usize),
{
    if options.chunk_size == 0 || options.chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidArgument(format!(
            "chunk size {} outside 1..={MAX_CHUNK_SIZE}",
            options.chunk_size
        )));
    }
    let length = u32::try_from(data.len()).map_err(|_| {
        Error::InvalidArgument(format!("{} bytes does not fit a 32-bit length", data.len()))
    })?;

    let (begin, data_op, end) = destination.opcodes();
    let crc = crc32(data);
    let total = data.len();

    // Validate the whole BEGIN payload before anything reaches the wire.
    let begin_payload = destination.begin_payload(length)?;

    info!("Writing {total} bytes to {destination} (CRC32 {crc:#010x})");
    exchange(port, begin, &begin_payload)?;

    let mut sent = 0;
    let mut chunks = 0;
    for chunk in data.chunks(options.chunk_size) {
        exchange(port, data_op, chunk)?;
        sent += chunk.len();
        chunks += 1;
        debug!("{data_op} #{chunks}: {} bytes ({sent}/{total})", chunk.len());
        progress(sent, total);
    }

    exchange(port, end, &destination.end_payload(crc, options.end_layout))?;
    info!("{destination} written: {chunks} chunks");

    Ok(TransferSummary {
        bytes: sent,
        chunks,
        crc,
    })
}

/// Read a file from disk and [`transfer`] it.
pub fn transfer_file<P, F>(
    port: &mut P,
    destination: &Destination,
    path: &Path,
    options: &TransferOptions,
    progress: F,
) -> Result<TransferSummary>
where
    P: Port + ?Sized,
    F: FnMut(usize, usize),
{
    let data = fs::read(path)?;
    debug!("Loaded {} ({} bytes)", path.display(), data.len());
    transfer(port, destination, &data, options, progress)
}

/// Mark a partition bootable.
pub fn set_boot<P: Port + ?Sized>(port: &mut P, name: &str) -> Result<()> {
    let field = partition_name(name)?;
    exchange(port, Opcode::PartitionSetBoot, &field)?;
    info!("Partition '{name}' marked bootable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseFault;
    use crate::testing::{MockDevice, Reply};
    use std::io::Write as _;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn test_begin_payload_shapes() {
        let ram = Destination::Ram { address: 0x2020_0000 };
        assert_eq!(
            ram.begin_payload(0x10).unwrap(),
            [0, 0, 0, 0, 0x20, 0x20, 0, 0, 0, 0, 0, 0x10]
        );

        let fs = Destination::Filesystem {
            path: "/SD:/a.bin".into(),
        };
        let payload = fs.begin_payload(3).unwrap();
        assert_eq!(&payload[..4], &[0, 0, 0, 3]);
        assert_eq!(&payload[4..], b"/SD:/a.bin");

        let part = Destination::Partition { name: "user".into() };
        let payload = part.begin_payload(1).unwrap();
        assert_eq!(payload.len(), PARTITION_NAME_LEN + 4);
        assert_eq!(&payload[..4], b"user");
        assert!(payload[4..PARTITION_NAME_LEN].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_end_payload_layouts() {
        let flash = Destination::Flash { offset: 0 };
        assert_eq!(flash.end_payload(0xAABB_CCDD, EndLayout::CrcOnly), [0xAA, 0xBB, 0xCC, 0xDD]);

        let with_resume = flash.end_payload(1, EndLayout::WithResumeAddress(0x6000_2000));
        assert_eq!(with_resume.len(), 12);
        assert_eq!(&with_resume[4..], &0x6000_2000u64.to_be_bytes());

        let fs = Destination::Filesystem { path: "/x".into() };
        assert_eq!(fs.end_payload(1, EndLayout::WithResumeAddress(5)).len(), 4);
    }

    #[test]
    fn test_partition_name_validation() {
        assert!(partition_name("").is_err());
        assert!(partition_name(&"a".repeat(65)).is_err());
        assert!(partition_name("us\0er").is_err());
        assert!(partition_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_chunk_count_and_reassembly() {
        for len in [0, 1, MAX_CHUNK_SIZE - 1, MAX_CHUNK_SIZE, MAX_CHUNK_SIZE + 1, 200_000] {
            let data = pattern(len);
            let mut device = MockDevice::new();
            let handle = device.handle();

            let summary = transfer(
                &mut device,
                &Destination::Flash { offset: 0x1000 },
                &data,
                &TransferOptions::default(),
                |_, _| {},
            )
            .unwrap();

            let chunks = handle.requests_for(Opcode::FlashData);
            assert_eq!(chunks.len(), len.div_ceil(MAX_CHUNK_SIZE));
            assert_eq!(summary.chunks, chunks.len());

            let joined: Vec<u8> = chunks.into_iter().flat_map(|r| r.payload).collect();
            assert_eq!(joined, data);
        }
    }

    #[test]
    fn test_end_crc_independent_of_chunking() {
        let data = pattern(10_000);
        for chunk_size in [1000, 4096, MAX_CHUNK_SIZE] {
            let mut device = MockDevice::new();
            let handle = device.handle();

            transfer(
                &mut device,
                &Destination::Ram { address: 0x2020_0000 },
                &data,
                &TransferOptions::default().with_chunk_size(chunk_size),
                |_, _| {},
            )
            .unwrap();

            let end = handle.requests_for(Opcode::RamEnd);
            assert_eq!(end.len(), 1);
            assert_eq!(end[0].payload, crc32(&data).to_be_bytes());
        }
    }

    #[test]
    fn test_filesystem_transfer_scenario() {
        let data = pattern(150_000);
        let mut device = MockDevice::new();
        let handle = device.handle();
        let mut reports = Vec::new();

        transfer(
            &mut device,
            &Destination::Filesystem {
                path: "/SD:/test.bin".into(),
            },
            &data,
            &TransferOptions::default(),
            |sent, total| reports.push((sent, total)),
        )
        .unwrap();

        let requests = handle.requests();
        assert_eq!(
            handle.opcodes(),
            [Opcode::FsBegin, Opcode::FsData, Opcode::FsData, Opcode::FsData, Opcode::FsEnd]
        );

        let mut begin = 150_000u32.to_be_bytes().to_vec();
        begin.extend_from_slice(b"/SD:/test.bin");
        assert_eq!(requests[0].payload, begin);

        let sizes: Vec<usize> = requests[1..4].iter().map(|r| r.payload.len()).collect();
        assert_eq!(sizes, [65536, 65536, 18928]);
        assert_eq!(requests[4].payload, crc32(&data).to_be_bytes());

        assert_eq!(reports, [(65536, 150_000), (131_072, 150_000), (150_000, 150_000)]);
    }

    #[test]
    fn test_set_boot_payload() {
        let mut device = MockDevice::new();
        let handle = device.handle();

        set_boot(&mut device, "user").unwrap();

        let requests = handle.requests_for(Opcode::PartitionSetBoot);
        let mut expected = b"user".to_vec();
        expected.extend_from_slice(&[0u8; 60]);
        assert_eq!(requests[0].payload, expected);
        assert_eq!(requests[0].payload.len(), 64);
    }

    #[test]
    fn test_device_error_mid_transfer_is_fatal() {
        let mut device = MockDevice::new();
        let handle = device.handle();
        handle.push_reply(Opcode::PartitionData, Reply::Ok(Vec::new()));
        handle.push_reply(Opcode::PartitionData, Reply::Status(0x05));

        let err = transfer(
            &mut device,
            &Destination::Partition { name: "user".into() },
            &pattern(3 * 1024),
            &TransferOptions::default().with_chunk_size(1024),
            |_, _| {},
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidResponse {
                opcode: Opcode::PartitionData,
                fault: ResponseFault::DeviceStatus(0x05),
            }
        ));
        assert_eq!(
            handle.opcodes(),
            [Opcode::PartitionBegin, Opcode::PartitionData, Opcode::PartitionData]
        );
    }

    #[test]
    fn test_invalid_name_rejected_before_begin() {
        let mut device = MockDevice::new();
        let handle = device.handle();

        let err = transfer(
            &mut device,
            &Destination::Partition { name: "x".repeat(65) },
            b"data",
            &TransferOptions::default(),
            |_, _| {},
        );

        assert!(matches!(err, Err(Error::InvalidArgument(_))));
        assert!(handle.requests().is_empty());
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut device = MockDevice::new();
        for chunk_size in [0, MAX_CHUNK_SIZE + 1] {
            let err = transfer(
                &mut device,
                &Destination::Ram { address: 0 },
                b"data",
                &TransferOptions::default().with_chunk_size(chunk_size),
                |_, _| {},
            );
            assert!(matches!(err, Err(Error::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_transfer_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let data = pattern(70_000);
        fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let mut device = MockDevice::new();
        let summary = transfer_file(
            &mut device,
            &Destination::Flash { offset: 0 },
            &path,
            &TransferOptions::default(),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(summary.bytes, 70_000);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.crc, crc32(&data));
    }

    #[test]
    fn test_transfer_missing_file_is_io_error() {
        let mut device = MockDevice::new();
        let err = transfer_file(
            &mut device,
            &Destination::Flash { offset: 0 },
            Path::new("/nonexistent/mmflash/image.bin"),
            &TransferOptions::default(),
            |_, _| {},
        );
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
