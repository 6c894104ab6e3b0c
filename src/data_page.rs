//! DataPage store (C4): best-fit placement, framed reads/writes, and
//! chain-local defragmentation over a linked list of DataPages owned by
//! one B-Tree node.

use crate::error::EngineError;
use crate::file_manager::{FileManager, NewPageKind};
use crate::page::{
    DataPage, UnallocatedRow, DATA_HEADER, DATA_PAGE_SPACE_TABLE_NUM_ENTRIES, FRAMING_LEN,
    MAX_DATA_SIZE,
};
use anyhow::Result;
use log::debug;
use std::collections::HashMap;

fn frame(value: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAMING_LEN + value.len());
    framed.extend_from_slice(&DATA_HEADER.to_be_bytes());
    framed.extend_from_slice(&(value.len() as u32).to_be_bytes());
    framed.extend_from_slice(value);
    framed
}

/// Walk `n` hops down `next_data_page` from `chain_root`.
fn nth_page_id(fm: &mut FileManager, chain_root: u32, n: usize) -> Result<u32> {
    let mut page_id = chain_root;
    for _ in 0..n {
        let dp = fm.read_data(page_id)?;
        if dp.next_data_page == 0 {
            return Err(EngineError::corrupt("logical offset runs past end of chain").into());
        }
        page_id = dp.next_data_page;
    }
    Ok(page_id)
}

/// Normalise a (page, byte) cursor so `byte_idx < MAX_DATA_SIZE`, hopping
/// forward across `next_data_page` links as needed.
fn normalize(fm: &mut FileManager, mut page_id: u32, mut byte_idx: usize) -> Result<(u32, usize)> {
    while byte_idx >= MAX_DATA_SIZE {
        let dp = fm.read_data(page_id)?;
        if dp.next_data_page == 0 {
            return Err(EngineError::corrupt("logical offset runs past end of chain").into());
        }
        page_id = dp.next_data_page;
        byte_idx -= MAX_DATA_SIZE;
    }
    Ok((page_id, byte_idx))
}

/// Read `length` bytes starting at `(page_id, byte_idx)`, crossing pages
/// as needed.
fn read_span(fm: &mut FileManager, mut page_id: u32, mut byte_idx: usize, mut length: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(length);
    while length > 0 {
        let dp = fm.read_data(page_id)?;
        let avail = MAX_DATA_SIZE - byte_idx;
        let chunk = length.min(avail);
        out.extend_from_slice(&dp.data[byte_idx..byte_idx + chunk]);
        length -= chunk;
        if length > 0 {
            if dp.next_data_page == 0 {
                return Err(EngineError::corrupt("logical offset runs past end of chain").into());
            }
            page_id = dp.next_data_page;
            byte_idx = 0;
        }
    }
    Ok(out)
}

struct Header {
    raw_len: u32,
}

fn read_header(fm: &mut FileManager, page_id: u32, byte_idx: usize) -> Result<Header> {
    let bytes = read_span(fm, page_id, byte_idx, FRAMING_LEN)?;
    let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
    if magic != DATA_HEADER {
        return Err(EngineError::corrupt(format!(
            "expected blob framing magic at page {} offset {}",
            page_id, byte_idx
        ))
        .into());
    }
    let raw_len = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
    Ok(Header { raw_len })
}

/// Sort the live prefix of `table` (length `*size`) descending by offset,
/// merge adjacent/overlapping runs, and compact out empty rows.
fn canonicalize_unalloc_table(dp: &mut DataPage) {
    let size = dp.space_table_size as usize;
    let mut rows: Vec<UnallocatedRow> = dp.unallocated_space_table[..size]
        .iter()
        .copied()
        .filter(|r| r.size != 0)
        .collect();

    rows.sort_by(|a, b| b.offset.cmp(&a.offset));

    let mut i = rows.len();
    while i > 1 {
        let (higher, lower) = (i - 2, i - 1);
        let a = rows[lower];
        let b = rows[higher];
        if a.offset + a.size == b.offset {
            rows[higher].offset = a.offset;
            rows[higher].size += a.size;
            rows[lower] = UnallocatedRow::default();
        }
        i -= 1;
    }
    rows.retain(|r| r.size != 0);

    let mut table = vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
    for (i, row) in rows.iter().enumerate() {
        table[i] = *row;
    }
    dp.unallocated_space_table = table;
    dp.space_table_size = rows.len() as u16;
}

/// Smallest run big enough to hold `needed` bytes; ties broken by
/// first-seen of equal size.
fn best_fit(table: &[UnallocatedRow], needed: usize) -> Option<usize> {
    let mut chosen: Option<usize> = None;
    for (i, row) in table.iter().enumerate() {
        if (row.size as usize) < needed {
            continue;
        }
        match chosen {
            None => chosen = Some(i),
            Some(c) if row.size < table[c].size => chosen = Some(i),
            _ => {}
        }
    }
    chosen
}

/// Sum the raw (unframed) length of every framed record whose header lives
/// on this single page. Used when a whole DataPage chain is being torn down
/// outside the normal `put`/`delete` path (e.g. deleting a node), where
/// `data_held` -- a framed byte count -- would overcount `total_data_size`
/// by `FRAMING_LEN` per record.
pub(crate) fn raw_content_size(dp: &DataPage) -> u64 {
    let mut total: u64 = 0;
    let mut k: usize = 0;
    while k + FRAMING_LEN <= MAX_DATA_SIZE {
        let magic = u16::from_be_bytes([dp.data[k], dp.data[k + 1]]);
        if magic != DATA_HEADER {
            k += 1;
            continue;
        }
        let raw_len = u32::from_be_bytes(dp.data[k + 2..k + 6].try_into().unwrap()) as usize;
        total += raw_len as u64;
        k += FRAMING_LEN + raw_len;
    }
    total
}

pub fn read(fm: &mut FileManager, chain_root: u32, offset: u32) -> Result<Vec<u8>> {
    let page_idx = offset as usize / MAX_DATA_SIZE;
    let byte_idx = offset as usize % MAX_DATA_SIZE;
    let first_page_id = nth_page_id(fm, chain_root, page_idx)?;
    let header = read_header(fm, first_page_id, byte_idx)?;
    let (body_page, body_byte) = normalize(fm, first_page_id, byte_idx + FRAMING_LEN)?;
    read_span(fm, body_page, body_byte, header.raw_len as usize)
}

pub fn put(fm: &mut FileManager, chain_root: u32, value: &[u8]) -> Result<u32> {
    let framed = frame(value);
    let framed_len = framed.len();

    let mut page_id = chain_root;
    let mut chain_index: u32 = 0;
    loop {
        let mut dp = fm.read_data(page_id)?;
        let live = dp.space_table_size as usize;
        if let Some(row_idx) = best_fit(&dp.unallocated_space_table[..live], framed_len) {
            let row = dp.unallocated_space_table[row_idx];
            let start = row.offset as usize;
            dp.data[start..start + framed_len].copy_from_slice(&framed);
            let remaining = row.size as usize - framed_len;
            if remaining == 0 {
                dp.unallocated_space_table[row_idx] = UnallocatedRow::default();
            } else {
                dp.unallocated_space_table[row_idx] = UnallocatedRow {
                    offset: (row.offset as usize + framed_len) as u16,
                    size: remaining as u16,
                };
            }
            canonicalize_unalloc_table(&mut dp);
            dp.data_held += framed_len as u16;
            fm.header.total_data_size += value.len() as u64;
            fm.save_data(page_id, &dp)?;
            let logical = chain_index * MAX_DATA_SIZE as u32 + start as u32;
            debug!("put: placed {} framed bytes at logical offset {}", framed_len, logical);
            return Ok(logical);
        }
        if dp.next_data_page == 0 {
            break;
        }
        page_id = dp.next_data_page;
        chain_index += 1;
    }

    // Nothing fit anywhere in the chain: defragment, then append at the tail.
    let parent = fm.read_data(chain_root)?.parent_node_page;
    debug!("put: no fit in chain rooted at {}, defragmenting before append", chain_root);
    if parent != 0 {
        crate::node::defragment_node(fm, parent)?;
    } else {
        defragment_datapage(fm, chain_root)?;
    }
    append_after_defragment(fm, chain_root, &framed, value.len())
}

fn append_after_defragment(
    fm: &mut FileManager,
    chain_root: u32,
    framed: &[u8],
    raw_len: usize,
) -> Result<u32> {
    let mut page_id = chain_root;
    let mut chain_index: u32 = 0;
    let mut dp = fm.read_data(page_id)?;
    while dp.next_data_page != 0 {
        page_id = dp.next_data_page;
        chain_index += 1;
        dp = fm.read_data(page_id)?;
    }

    let start_offset = if dp.space_table_size > 0 {
        dp.unallocated_space_table[0].offset as usize
    } else {
        MAX_DATA_SIZE
    };
    let available_here = MAX_DATA_SIZE - start_offset;
    let framed_len = framed.len();
    let extra_needed = framed_len.saturating_sub(available_here);
    let additional_pages = if extra_needed == 0 {
        0
    } else {
        (extra_needed + MAX_DATA_SIZE - 1) / MAX_DATA_SIZE
    };

    let start_logical = chain_index * MAX_DATA_SIZE as u32 + start_offset as u32;
    let parent_node_page = dp.parent_node_page;

    let mut last_page_id = page_id;
    for _ in 0..additional_pages {
        let new_id = fm.make_page(NewPageKind::Data)?;
        let mut last_dp = fm.read_data(last_page_id)?;
        last_dp.next_data_page = new_id;
        fm.save_data(last_page_id, &last_dp)?;
        if parent_node_page != 0 {
            fm.stamp_parent_node(new_id, parent_node_page)?;
        }
        last_page_id = new_id;
    }

    let mut cur_page = page_id;
    let mut cur_offset = start_offset;
    let mut consumed = 0usize;
    while consumed < framed_len {
        let mut cur_dp = fm.read_data(cur_page)?;
        let capacity_here = MAX_DATA_SIZE - cur_offset;
        let chunk = (framed_len - consumed).min(capacity_here);
        cur_dp.data[cur_offset..cur_offset + chunk]
            .copy_from_slice(&framed[consumed..consumed + chunk]);
        let new_held = cur_offset + chunk;
        cur_dp.data_held = new_held as u16;
        if new_held == MAX_DATA_SIZE {
            cur_dp.space_table_size = 0;
            cur_dp.unallocated_space_table =
                vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
        } else {
            let mut table = vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
            table[0] = UnallocatedRow {
                offset: new_held as u16,
                size: (MAX_DATA_SIZE - new_held) as u16,
            };
            cur_dp.unallocated_space_table = table;
            cur_dp.space_table_size = 1;
        }
        let next = cur_dp.next_data_page;
        fm.save_data(cur_page, &cur_dp)?;
        consumed += chunk;
        if consumed < framed_len {
            cur_page = next;
            cur_offset = 0;
        }
    }

    fm.header.total_data_size += raw_len as u64;
    debug!(
        "put: appended {} framed bytes across {} new page(s) at logical offset {}",
        framed_len, additional_pages, start_logical
    );
    Ok(start_logical)
}

pub fn delete(fm: &mut FileManager, chain_root: u32, offset: u32) -> Result<()> {
    let page_idx = offset as usize / MAX_DATA_SIZE;
    let byte_idx = offset as usize % MAX_DATA_SIZE;
    let first_page_id = nth_page_id(fm, chain_root, page_idx)?;
    let header = read_header(fm, first_page_id, byte_idx)?;
    let framed_len = FRAMING_LEN + header.raw_len as usize;

    let mut overflow = false;
    let mut page_id = first_page_id;
    let mut local_byte = byte_idx;
    let mut remaining = framed_len;
    while remaining > 0 {
        let mut dp = fm.read_data(page_id)?;
        let capacity_here = MAX_DATA_SIZE - local_byte;
        let chunk = remaining.min(capacity_here);
        for b in dp.data[local_byte..local_byte + chunk].iter_mut() {
            *b = 0;
        }
        dp.data_held = dp.data_held.saturating_sub(chunk as u16);
        if (dp.space_table_size as usize) >= DATA_PAGE_SPACE_TABLE_NUM_ENTRIES {
            overflow = true;
        } else {
            let row_idx = dp.space_table_size as usize;
            dp.unallocated_space_table[row_idx] = UnallocatedRow {
                offset: local_byte as u16,
                size: chunk as u16,
            };
            dp.space_table_size += 1;
            canonicalize_unalloc_table(&mut dp);
        }
        let next = dp.next_data_page;
        fm.save_data(page_id, &dp)?;
        remaining -= chunk;
        if remaining > 0 {
            if next == 0 {
                return Err(EngineError::corrupt("deleted record extends past end of chain").into());
            }
            page_id = next;
            local_byte = 0;
        }
    }

    fm.header.total_data_size = fm
        .header
        .total_data_size
        .saturating_sub(header.raw_len as u64);

    if overflow {
        let parent = fm.read_data(first_page_id)?.parent_node_page;
        debug!("delete: free table overflowed on page {}, defragmenting", first_page_id);
        if parent != 0 {
            crate::node::defragment_node(fm, parent)?;
        } else {
            defragment_datapage(fm, chain_root)?;
        }
    }
    Ok(())
}

fn load_chain(fm: &mut FileManager, chain_root: u32) -> Result<Vec<(u32, DataPage)>> {
    let mut chain = Vec::new();
    let mut page_id = chain_root;
    loop {
        let dp = fm.read_data(page_id)?;
        let next = dp.next_data_page;
        chain.push((page_id, dp));
        if next == 0 {
            break;
        }
        page_id = next;
    }
    Ok(chain)
}

/// Compact every framed record in the chain toward the front, returning a
/// map from old logical offset to new logical offset. Any DataPage that
/// ends up entirely empty at the tail is deleted (the chain root page is
/// never deleted here, even if it ends up empty).
pub fn defragment_datapage(fm: &mut FileManager, chain_root: u32) -> Result<HashMap<u32, u32>> {
    debug!("defragment_datapage: compacting chain rooted at {}", chain_root);
    let chain = load_chain(fm, chain_root)?;
    let num_pages = chain.len();
    let total_len = num_pages * MAX_DATA_SIZE;

    let mut src = Vec::with_capacity(total_len);
    for (_, dp) in &chain {
        src.extend_from_slice(&dp.data);
    }
    let mut dst = vec![0u8; total_len];

    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut j: usize = 0;
    let mut k: usize = 0;
    while k + FRAMING_LEN <= total_len {
        let magic = u16::from_be_bytes([src[k], src[k + 1]]);
        if magic != DATA_HEADER {
            k += 1;
            continue;
        }
        let raw_len = u32::from_be_bytes(src[k + 2..k + 6].try_into().unwrap()) as usize;
        let framed_len = FRAMING_LEN + raw_len;
        if k + framed_len > total_len {
            // Can't be a real record (would run off the chain); treat as a gap byte.
            k += 1;
            continue;
        }
        if j == k {
            dst[j..j + framed_len].copy_from_slice(&src[k..k + framed_len]);
        } else {
            let rem_in_page = MAX_DATA_SIZE - (j % MAX_DATA_SIZE);
            if rem_in_page <= FRAMING_LEN {
                j += rem_in_page;
            }
            remap.insert(k as u32, j as u32);
            dst[j..j + framed_len].copy_from_slice(&src[k..k + framed_len]);
        }
        j += framed_len;
        k += framed_len;
    }

    let mut first_empty: Option<usize> = None;
    let mut pages: Vec<DataPage> = Vec::with_capacity(num_pages);
    for p in 0..num_pages {
        let slice = &dst[p * MAX_DATA_SIZE..(p + 1) * MAX_DATA_SIZE];
        let mut trailing_zero = 0usize;
        while trailing_zero < MAX_DATA_SIZE && slice[MAX_DATA_SIZE - 1 - trailing_zero] == 0 {
            trailing_zero += 1;
        }
        let data_held = MAX_DATA_SIZE - trailing_zero;
        let mut new_dp = chain[p].1.clone();
        new_dp.data = slice.to_vec();
        new_dp.data_held = data_held as u16;
        if data_held == MAX_DATA_SIZE {
            new_dp.space_table_size = 0;
            new_dp.unallocated_space_table =
                vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
        } else {
            let mut table = vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
            table[0] = UnallocatedRow {
                offset: data_held as u16,
                size: trailing_zero as u16,
            };
            new_dp.unallocated_space_table = table;
            new_dp.space_table_size = 1;
        }
        if trailing_zero == MAX_DATA_SIZE && first_empty.is_none() {
            first_empty = Some(p);
        }
        pages.push(new_dp);
    }

    let delete_from = first_empty.map(|i| i.max(1));

    if let Some(cut) = delete_from {
        if cut < num_pages {
            pages[cut - 1].next_data_page = 0;
        }
    }

    for p in 0..num_pages {
        fm.save_data(chain[p].0, &pages[p])?;
    }

    if let Some(cut) = delete_from {
        if cut < num_pages {
            fm.delete_page(chain[cut].0)?;
        }
    }

    debug!("defragment_datapage: {} record(s) relocated", remap.len());
    Ok(remap)
}
