//! File I/O (C2): positioned 4 KiB reads and writes on the backing file.

use crate::error::EngineError;
use crate::page::PAGESIZE;
use anyhow::Result;
use log::trace;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Read the page at `page_id`. Returns whatever bytes are available up to
/// `PAGESIZE` -- a short read at EOF is not a hard error, it just means the
/// caller will see a buffer too small to carry a valid magic, which decodes
/// as `Free`.
pub fn read_page(file: &mut File, page_id: u32) -> Result<Vec<u8>> {
    let offset = page_id as u64 * PAGESIZE as u64;
    let file_len = file
        .metadata()
        .map_err(|e| EngineError::io_at(page_id, e))?
        .len();
    if offset >= file_len {
        return Err(EngineError::invalid(format!(
            "page {} is out of the scope of the file",
            page_id
        ))
        .into());
    }
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| EngineError::io_at(page_id, e))?;
    let mut buf = vec![0u8; PAGESIZE];
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return Err(EngineError::io_at(page_id, e).into()),
        }
    }
    trace!("read_page {} ({} bytes)", page_id, total);
    buf.truncate(total);
    Ok(buf)
}

/// Write exactly `PAGESIZE` bytes at `page_id`, appending past EOF.
pub fn write_page(file: &mut File, page_id: u32, data: &[u8]) -> Result<()> {
    if data.len() != PAGESIZE {
        return Err(EngineError::invalid(format!(
            "page payload must be exactly {} bytes, got {}",
            PAGESIZE,
            data.len()
        ))
        .into());
    }
    let offset = page_id as u64 * PAGESIZE as u64;
    let current_size = file
        .metadata()
        .map_err(|e| EngineError::io_at(page_id, e))?
        .len();
    if offset >= current_size {
        file.seek(SeekFrom::End(0))
            .map_err(|e| EngineError::io_at(page_id, e))?;
    } else {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::io_at(page_id, e))?;
    }
    file.write_all(data)
        .map_err(|e| EngineError::io_at(page_id, e))?;
    trace!("write_page {}", page_id);
    Ok(())
}

/// Truncate the file to hold exactly `num_pages` pages.
pub fn truncate_to_pages(file: &mut File, num_pages: u32) -> Result<()> {
    let len = num_pages as u64 * PAGESIZE as u64;
    file.set_len(len).map_err(EngineError::io)?;
    Ok(())
}

pub fn page_count(file: &File) -> Result<u32> {
    let len = file.metadata().map_err(EngineError::io)?.len();
    Ok((len / PAGESIZE as u64) as u32)
}
