//! Page codec (C1): fixed 4096-byte page variants and their byte-exact
//! encode/decode. Big-endian throughout; every reserved region is
//! zero-filled on write.

use crate::error::EngineError;
use anyhow::Result;

pub const PAGESIZE: usize = 4096;
pub const PAGE_IDENTITY_NUM: u32 = 0x6EBC061F;

pub const MAX_DEGREE: usize = 336; // [DO NOT CHANGE]
pub const MIN_BLOCK_SIZE: usize = MAX_DEGREE / 2 - 1;

pub const NUM_FREE_SPACE_ENTRIES_FILE_HEADER: usize = 200;
pub const DATA_PAGE_SPACE_TABLE_NUM_ENTRIES: usize = 123;
pub const NODE_PAGE_HEADER_SIZE: usize = 60;
pub const DATA_PAGE_HEADER_SIZE: usize = 512;
pub const MAX_DATA_SIZE: usize = PAGESIZE - DATA_PAGE_HEADER_SIZE;

pub const DATA_HEADER: u16 = 0x1E7F;
pub const FRAMING_LEN: usize = 6; // 2-byte magic + 4-byte length

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    FileHeader,
    Node,
    Data,
    Free,
}

impl PageType {
    fn tag(self) -> u8 {
        match self {
            PageType::FileHeader => 21,
            PageType::Node => 33,
            PageType::Data => 45,
            PageType::Free => 0,
        }
    }

    fn from_tag(tag: u8) -> Option<PageType> {
        match tag {
            21 => Some(PageType::FileHeader),
            33 => Some(PageType::Node),
            45 => Some(PageType::Data),
            _ => None,
        }
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}
fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}
fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}
fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

/// Read the 4-byte magic + 1-byte type tag, returning `None` when the
/// magic doesn't match -- such a page is *Free*, not an error.
fn decode_header(buf: &[u8]) -> Option<PageType> {
    if buf.len() < 5 {
        return None;
    }
    let magic = read_u32(buf, 0);
    if magic != PAGE_IDENTITY_NUM {
        return None;
    }
    PageType::from_tag(buf[4])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeSpaceRow {
    pub page_id: u32,
    pub num_pages: u16,
}

#[derive(Debug, Clone)]
pub struct FileHeaderPage {
    pub total_pages: u32,
    pub total_data_size: u64,
    pub root_node_id: u32,
    pub space_table_size: u16,
    pub free_space_table: Vec<FreeSpaceRow>, // always length NUM_FREE_SPACE_ENTRIES_FILE_HEADER
}

impl FileHeaderPage {
    pub fn new() -> Self {
        FileHeaderPage {
            total_pages: 1,
            total_data_size: 0,
            root_node_id: 0,
            space_table_size: 0,
            free_space_table: vec![FreeSpaceRow::default(); NUM_FREE_SPACE_ENTRIES_FILE_HEADER],
        }
    }

    pub fn to_bytes(&self) -> [u8; PAGESIZE] {
        let mut buf = [0u8; PAGESIZE];
        write_u32(&mut buf, 0, PAGE_IDENTITY_NUM);
        buf[4] = PageType::FileHeader.tag();
        write_u32(&mut buf, 5, self.total_pages);
        write_u64(&mut buf, 9, self.total_data_size);
        write_u32(&mut buf, 17, self.root_node_id);
        write_u16(&mut buf, 21, self.space_table_size);
        let mut off = 23;
        for i in 0..NUM_FREE_SPACE_ENTRIES_FILE_HEADER {
            let row = self.free_space_table.get(i).copied().unwrap_or_default();
            write_u32(&mut buf, off, row.page_id);
            write_u16(&mut buf, off + 4, row.num_pages);
            off += 6;
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let total_pages = read_u32(buf, 5);
        let total_data_size = read_u64(buf, 9);
        let root_node_id = read_u32(buf, 17);
        let space_table_size = read_u16(buf, 21);
        let mut free_space_table = Vec::with_capacity(NUM_FREE_SPACE_ENTRIES_FILE_HEADER);
        let mut off = 23;
        for _ in 0..NUM_FREE_SPACE_ENTRIES_FILE_HEADER {
            free_space_table.push(FreeSpaceRow {
                page_id: read_u32(buf, off),
                num_pages: read_u16(buf, off + 4),
            });
            off += 6;
        }
        FileHeaderPage {
            total_pages,
            total_data_size,
            root_node_id,
            space_table_size,
            free_space_table,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnallocatedRow {
    pub offset: u16,
    pub size: u16,
}

#[derive(Debug, Clone)]
pub struct DataPage {
    pub data_held: u16,
    pub next_data_page: u32,
    pub parent_node_page: u32,
    pub space_table_size: u16,
    pub unallocated_space_table: Vec<UnallocatedRow>, // always length DATA_PAGE_SPACE_TABLE_NUM_ENTRIES
    pub data: Vec<u8>,                                // always length MAX_DATA_SIZE
}

impl DataPage {
    pub fn new() -> Self {
        let mut table = vec![UnallocatedRow::default(); DATA_PAGE_SPACE_TABLE_NUM_ENTRIES];
        table[0] = UnallocatedRow {
            offset: 0,
            size: MAX_DATA_SIZE as u16,
        };
        DataPage {
            data_held: 0,
            next_data_page: 0,
            parent_node_page: 0,
            space_table_size: 1,
            unallocated_space_table: table,
            data: vec![0u8; MAX_DATA_SIZE],
        }
    }

    pub fn to_bytes(&self) -> [u8; PAGESIZE] {
        let mut buf = [0u8; PAGESIZE];
        write_u32(&mut buf, 0, PAGE_IDENTITY_NUM);
        buf[4] = PageType::Data.tag();
        write_u16(&mut buf, 5, self.data_held);
        write_u32(&mut buf, 7, self.next_data_page);
        write_u32(&mut buf, 11, self.parent_node_page);
        write_u16(&mut buf, 15, self.space_table_size);
        let mut off = 17;
        for i in 0..DATA_PAGE_SPACE_TABLE_NUM_ENTRIES {
            let row = self
                .unallocated_space_table
                .get(i)
                .copied()
                .unwrap_or_default();
            write_u16(&mut buf, off, row.offset);
            write_u16(&mut buf, off + 2, row.size);
            off += 4;
        }
        buf[DATA_PAGE_HEADER_SIZE..].copy_from_slice(&self.data[..MAX_DATA_SIZE]);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let data_held = read_u16(buf, 5);
        let next_data_page = read_u32(buf, 7);
        let parent_node_page = read_u32(buf, 11);
        let space_table_size = read_u16(buf, 15);
        let mut unallocated_space_table = Vec::with_capacity(DATA_PAGE_SPACE_TABLE_NUM_ENTRIES);
        let mut off = 17;
        for _ in 0..DATA_PAGE_SPACE_TABLE_NUM_ENTRIES {
            unallocated_space_table.push(UnallocatedRow {
                offset: read_u16(buf, off),
                size: read_u16(buf, off + 2),
            });
            off += 4;
        }
        let data = buf[DATA_PAGE_HEADER_SIZE..PAGESIZE].to_vec();
        DataPage {
            data_held,
            next_data_page,
            parent_node_page,
            space_table_size,
            unallocated_space_table,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCell {
    pub key: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct NodePage {
    pub data_page_id: u32,
    pub block_size: u16,
    pub blocks: Vec<NodeCell>, // always length MAX_DEGREE
    pub children: Vec<u32>,    // always length MAX_DEGREE + 1
}

impl NodePage {
    pub fn new() -> Self {
        NodePage {
            data_page_id: 0,
            block_size: 0,
            blocks: vec![NodeCell::default(); MAX_DEGREE],
            children: vec![0u32; MAX_DEGREE + 1],
        }
    }

    pub fn to_bytes(&self) -> [u8; PAGESIZE] {
        let mut buf = [0u8; PAGESIZE];
        write_u32(&mut buf, 0, PAGE_IDENTITY_NUM);
        buf[4] = PageType::Node.tag();
        write_u32(&mut buf, 5, self.data_page_id);
        write_u16(&mut buf, 9, self.block_size);
        let mut off = NODE_PAGE_HEADER_SIZE;
        for i in 0..MAX_DEGREE {
            let cell = self.blocks.get(i).copied().unwrap_or_default();
            write_u32(&mut buf, off, cell.key);
            write_u32(&mut buf, off + 4, cell.offset);
            off += 8;
        }
        for i in 0..(MAX_DEGREE + 1) {
            let child = self.children.get(i).copied().unwrap_or(0);
            write_u32(&mut buf, off, child);
            off += 4;
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let data_page_id = read_u32(buf, 5);
        let block_size = read_u16(buf, 9);
        let mut blocks = Vec::with_capacity(MAX_DEGREE);
        let mut off = NODE_PAGE_HEADER_SIZE;
        for _ in 0..MAX_DEGREE {
            blocks.push(NodeCell {
                key: read_u32(buf, off),
                offset: read_u32(buf, off + 4),
            });
            off += 8;
        }
        let mut children = Vec::with_capacity(MAX_DEGREE + 1);
        for _ in 0..(MAX_DEGREE + 1) {
            children.push(read_u32(buf, off));
            off += 4;
        }
        NodePage {
            data_page_id,
            block_size,
            blocks,
            children,
        }
    }
}

/// Decoded page, tagged by type. A `Free` page carries no payload: its
/// magic didn't match, which is the expected shape for any page never
/// written or already deleted.
#[derive(Debug, Clone)]
pub enum Page {
    FileHeader(FileHeaderPage),
    Node(NodePage),
    Data(DataPage),
    Free,
}

impl Page {
    pub fn decode(buf: &[u8]) -> Self {
        match decode_header(buf) {
            Some(PageType::FileHeader) => Page::FileHeader(FileHeaderPage::from_bytes(buf)),
            Some(PageType::Node) => Page::Node(NodePage::from_bytes(buf)),
            Some(PageType::Data) => Page::Data(DataPage::from_bytes(buf)),
            _ => Page::Free,
        }
    }

    pub fn page_type(&self) -> PageType {
        match self {
            Page::FileHeader(_) => PageType::FileHeader,
            Page::Node(_) => PageType::Node,
            Page::Data(_) => PageType::Data,
            Page::Free => PageType::Free,
        }
    }
}

pub fn expect_node(page: Page, page_id: u32) -> Result<NodePage> {
    match page {
        Page::Node(n) => Ok(n),
        other => Err(EngineError::corrupt(format!(
            "page {} isn't a node page (found {:?})",
            page_id,
            other.page_type()
        ))
        .into()),
    }
}

pub fn expect_data(page: Page, page_id: u32) -> Result<DataPage> {
    match page {
        Page::Data(d) => Ok(d),
        other => Err(EngineError::corrupt(format!(
            "page {} isn't a data page (found {:?})",
            page_id,
            other.page_type()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trips() {
        let mut h = FileHeaderPage::new();
        h.total_pages = 7;
        h.total_data_size = 12345;
        h.root_node_id = 3;
        h.space_table_size = 2;
        h.free_space_table[0] = FreeSpaceRow { page_id: 5, num_pages: 2 };
        h.free_space_table[1] = FreeSpaceRow { page_id: 9, num_pages: 1 };

        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), PAGESIZE);
        let back = FileHeaderPage::from_bytes(&bytes);
        assert_eq!(back.total_pages, 7);
        assert_eq!(back.total_data_size, 12345);
        assert_eq!(back.root_node_id, 3);
        assert_eq!(back.space_table_size, 2);
        assert_eq!(back.free_space_table[0], FreeSpaceRow { page_id: 5, num_pages: 2 });
        assert_eq!(back.free_space_table[1], FreeSpaceRow { page_id: 9, num_pages: 1 });
    }

    #[test]
    fn data_page_round_trips() {
        let mut d = DataPage::new();
        d.data_held = 10;
        d.next_data_page = 4;
        d.parent_node_page = 2;
        d.data[0..4].copy_from_slice(&[1, 2, 3, 4]);

        let bytes = d.to_bytes();
        let back = DataPage::from_bytes(&bytes);
        assert_eq!(back.data_held, 10);
        assert_eq!(back.next_data_page, 4);
        assert_eq!(back.parent_node_page, 2);
        assert_eq!(&back.data[0..4], &[1, 2, 3, 4]);
        assert_eq!(back.unallocated_space_table[0], UnallocatedRow { offset: 0, size: MAX_DATA_SIZE as u16 });
    }

    #[test]
    fn node_page_round_trips() {
        let mut n = NodePage::new();
        n.data_page_id = 6;
        n.block_size = 2;
        n.blocks[0] = NodeCell { key: 10, offset: 100 };
        n.blocks[1] = NodeCell { key: 20, offset: 200 };
        n.children[0] = 1;
        n.children[1] = 2;
        n.children[2] = 3;

        let bytes = n.to_bytes();
        let back = NodePage::from_bytes(&bytes);
        assert_eq!(back.data_page_id, 6);
        assert_eq!(back.block_size, 2);
        assert_eq!(back.blocks[0], NodeCell { key: 10, offset: 100 });
        assert_eq!(back.blocks[1], NodeCell { key: 20, offset: 200 });
        assert_eq!(&back.children[0..3], &[1, 2, 3]);
    }

    #[test]
    fn decode_treats_bad_magic_as_free() {
        let buf = [0u8; PAGESIZE];
        assert!(matches!(Page::decode(&buf), Page::Free));

        let short = [0u8; 3];
        assert!(matches!(Page::decode(&short), Page::Free));
    }

    #[test]
    fn layout_sizes_fit_within_one_page() {
        assert_eq!(NODE_PAGE_HEADER_SIZE + MAX_DEGREE * 8 + (MAX_DEGREE + 1) * 4, PAGESIZE);
        assert!(17 + DATA_PAGE_SPACE_TABLE_NUM_ENTRIES * 4 <= DATA_PAGE_HEADER_SIZE);
        assert_eq!(DATA_PAGE_HEADER_SIZE + MAX_DATA_SIZE, PAGESIZE);
    }
}
