//! Image block reader.
//!
//! Each read-image command returns one block: a 16-byte header with a
//! status, a flags byte and the declared data size, followed by the data.
//! The first read takes a fixed 512 bytes; the rest of the block is read
//! only when that first read came back full.

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::channel::CommandChannel;
use crate::error::DriverError;
use crate::protocol::frame::{BlockLayout, decode_block_header};
use crate::protocol::status::StatusCode;
use crate::retry::CancelToken;
use crate::transport::ScannerTransport;

bitflags! {
    /// Flags byte of an image block header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const END_OF_SCAN = 0x08;
        const NO_PAPER = 0x10;
        /// The next block is the final, short one.
        const LAST_BLOCK = 0x20;
    }
}

impl BlockFlags {
    /// Both the last-block and end-of-scan bits are set.
    pub fn is_end_of_image(&self) -> bool {
        self.contains(Self::LAST_BLOCK | Self::END_OF_SCAN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlock {
    pub data: Vec<u8>,
    pub declared: usize,
    pub flags: BlockFlags,
}

impl ImageBlock {
    /// No data yet and no terminal flag: poll again.
    pub fn is_pending(&self) -> bool {
        self.data.is_empty() && !self.flags.is_end_of_image()
    }
}

#[derive(Debug)]
pub struct BlockReader {
    layout: BlockLayout,
    last_flags: BlockFlags,
    /// A read-image command was written and its data not fully read.
    outstanding: bool,
    blocks: u64,
    bytes: u64,
}

impl BlockReader {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            last_flags: BlockFlags::empty(),
            outstanding: false,
            blocks: 0,
            bytes: 0,
        }
    }

    /// Data bytes to ask for in the next read-image command.
    pub fn request_size(&self) -> usize {
        if self.last_flags.contains(BlockFlags::LAST_BLOCK) {
            self.layout.tail_request
        } else {
            (self.layout.max_block / self.layout.granule.max(1)) * self.layout.granule
        }
    }

    pub fn last_flags(&self) -> BlockFlags {
        self.last_flags
    }

    pub fn is_end_of_image(&self) -> bool {
        self.last_flags.is_end_of_image()
    }

    /// True while a block transfer is in flight, e.g. after an error
    /// between the two reads. Teardown drains the channel then.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Request and receive one block.
    pub fn read_block<T: ScannerTransport>(
        &mut self,
        channel: &CommandChannel<T>,
        cancel: &CancelToken,
    ) -> Result<ImageBlock, DriverError> {
        let request = self.request_size();
        let cmd = channel.table().read_image(request);
        cancel.check()?;
        channel.send(&cmd)?;
        self.outstanding = true;

        let first = channel.receive(self.layout.first_read, cancel)?;
        let status = StatusCode::from_bytes(&first)
            .ok_or_else(|| DriverError::Protocol(format!("block response of {} bytes", first.len())))?;
        if let Some(err) = DriverError::from_status(status) {
            self.outstanding = false;
            return Err(err);
        }
        let header = decode_block_header(&self.layout, &first)?;

        let mut data = first[self.layout.header_len..].to_vec();
        if first.len() == self.layout.first_read {
            let rest = self.layout.max_block + self.layout.header_len - self.layout.first_read;
            data.extend(channel.read_raw(rest)?);
        }
        self.outstanding = false;

        let flags = BlockFlags::from_bits_retain(header.flags);
        let unknown = flags.difference(BlockFlags::all());
        if !unknown.is_empty() {
            debug!(flags = %format!("0x{:02X}", header.flags), "Unexpected block flags");
        }
        if data.len() != header.declared {
            return Err(DriverError::Protocol(format!(
                "block declared {} bytes, received {}",
                header.declared,
                data.len()
            )));
        }

        self.last_flags = flags & BlockFlags::all();
        self.blocks += 1;
        self.bytes += data.len() as u64;
        trace!(
            request,
            len = data.len(),
            flags = %format!("0x{:02X}", header.flags),
            "Image block"
        );
        Ok(ImageBlock {
            data,
            declared: header.declared,
            flags: self.last_flags,
        })
    }
}
