//! NodePage facade (C5): maps B-Tree key/child structure onto the fixed
//! `blocks`/`children` arrays of a NodePage, and drives the DataPage chain
//! that holds each node's values.

use crate::data_page;
use crate::error::EngineError;
use crate::file_manager::{FileManager, NewPageKind};
use crate::page::{NodeCell, MAX_DEGREE};
use anyhow::Result;
use log::debug;

/// `Ok(i)` when `key` sits at `blocks[i]`; `Err(i)` when it doesn't, where
/// `i` is both the insertion point in `blocks` and the child index to
/// descend into.
pub fn binary_index_node(node: &crate::page::NodePage, key: u32) -> std::result::Result<usize, usize> {
    let live = &node.blocks[..node.block_size as usize];
    live.binary_search_by(|cell| cell.key.cmp(&key))
}

pub fn read_from_node(fm: &mut FileManager, node_id: u32, key: u32) -> Result<Option<Vec<u8>>> {
    let node = fm.read_node(node_id)?;
    match binary_index_node(&node, key) {
        Ok(i) => {
            let offset = node.blocks[i].offset;
            Ok(Some(data_page::read(fm, node.data_page_id, offset)?))
        }
        Err(_) => Ok(None),
    }
}

/// Insert `(key, value)` into `node_id`'s blocks, wiring `new_child_id` as
/// the left or right child of the new entry depending on
/// `place_child_left_of_new`. Errors if `key` is already present or the
/// node has no room left.
pub fn put_in_node(
    fm: &mut FileManager,
    node_id: u32,
    key: u32,
    value: &[u8],
    new_child_id: u32,
    place_child_left_of_new: bool,
) -> Result<()> {
    let mut node = fm.read_node(node_id)?;
    if node.data_page_id == 0 {
        let data_page_id = fm.make_page(NewPageKind::Data)?;
        node.data_page_id = data_page_id;
        fm.save_node(node_id, &node)?;
        fm.stamp_parent_node(data_page_id, node_id)?;
    }
    if node.block_size as usize == MAX_DEGREE {
        return Err(EngineError::corrupt(format!(
            "put_in_node: node {} is already full",
            node_id
        ))
        .into());
    }
    if binary_index_node(&node, key).is_ok() {
        return Err(EngineError::KeyDuplicate(key).into());
    }

    let data_page_id = node.data_page_id;
    let offset = data_page::put(fm, data_page_id, value)?;

    // data_page::put may have triggered defragment_node on this very node,
    // which rewrites blocks[].offset -- re-read before mutating.
    let mut node = fm.read_node(node_id)?;
    let idx = match binary_index_node(&node, key) {
        Ok(i) => i,
        Err(i) => i,
    };
    let block_size = node.block_size as usize;

    for b in (idx..block_size).rev() {
        node.blocks[b + 1] = node.blocks[b];
    }
    node.blocks[idx] = NodeCell { key, offset };

    let child_idx = if place_child_left_of_new { idx } else { idx + 1 };
    for c in (child_idx..=block_size).rev() {
        node.children[c + 1] = node.children[c];
    }
    node.children[child_idx] = new_child_id;

    node.block_size = (block_size + 1) as u16;
    fm.save_node(node_id, &node)?;
    Ok(())
}

/// Remove `key` from `node_id`'s blocks, closing the hole, and drop the
/// associated value from its DataPage chain. By default the child
/// immediately to the *right* of `key` is dropped; pass
/// `delete_left_child_of_key = true` to drop the one to its *left* instead
/// (used when rotating a border key during a borrow).
pub fn delete_in_node(
    fm: &mut FileManager,
    node_id: u32,
    key: u32,
    delete_left_child_of_key: bool,
) -> Result<()> {
    let node = fm.read_node(node_id)?;
    let idx = match binary_index_node(&node, key) {
        Ok(i) => i,
        Err(_) => {
            return Err(EngineError::corrupt(format!(
                "delete_in_node: key {} not present in node {}",
                key, node_id
            ))
            .into())
        }
    };
    let data_page_id = node.data_page_id;
    let offset = node.blocks[idx].offset;

    let mut node = node;
    let block_size = node.block_size as usize;
    for b in idx..block_size.saturating_sub(1) {
        node.blocks[b] = node.blocks[b + 1];
    }
    node.blocks[block_size - 1] = NodeCell::default();

    let child_remove_idx = if delete_left_child_of_key { idx } else { idx + 1 };
    for c in child_remove_idx..block_size {
        node.children[c] = node.children[c + 1];
    }
    node.children[block_size] = 0;

    node.block_size = (block_size - 1) as u16;
    fm.save_node(node_id, &node)?;

    data_page::delete(fm, data_page_id, offset)?;
    Ok(())
}

/// Compact the DataPage chain owned by `node_id` and rewrite every
/// surviving block's `offset` to track the relocation.
pub fn defragment_node(fm: &mut FileManager, node_id: u32) -> Result<()> {
    let node = fm.read_node(node_id)?;
    let remap = data_page::defragment_datapage(fm, node.data_page_id)?;
    if remap.is_empty() {
        return Ok(());
    }
    let mut node = fm.read_node(node_id)?;
    let block_size = node.block_size as usize;
    let mut changed = false;
    for i in 0..block_size {
        if let Some(&new_offset) = remap.get(&node.blocks[i].offset) {
            node.blocks[i].offset = new_offset;
            changed = true;
        }
    }
    if changed {
        fm.save_node(node_id, &node)?;
    }
    debug!("defragment_node: {} block(s) remapped on node {}", remap.len(), node_id);
    Ok(())
}

pub fn is_full(node: &crate::page::NodePage) -> bool {
    node.block_size as usize == MAX_DEGREE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FileManager;

    fn tmp_node() -> (FileManager, tempfile::TempDir, u32) {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::create(dir.path().join("test.db")).unwrap();
        let node_id = fm.make_page(NewPageKind::Node).unwrap();
        (fm, dir, node_id)
    }

    #[test]
    fn put_then_read_round_trips() {
        let (mut fm, _dir, node_id) = tmp_node();
        put_in_node(&mut fm, node_id, 10, b"ten", 0, false).unwrap();
        put_in_node(&mut fm, node_id, 5, b"five", 0, false).unwrap();
        put_in_node(&mut fm, node_id, 20, b"twenty", 0, false).unwrap();

        assert_eq!(read_from_node(&mut fm, node_id, 5).unwrap().unwrap(), b"five");
        assert_eq!(read_from_node(&mut fm, node_id, 10).unwrap().unwrap(), b"ten");
        assert_eq!(read_from_node(&mut fm, node_id, 20).unwrap().unwrap(), b"twenty");
        assert!(read_from_node(&mut fm, node_id, 99).unwrap().is_none());

        let node = fm.read_node(node_id).unwrap();
        assert_eq!(node.block_size, 3);
        assert_eq!(node.blocks[0].key, 5);
        assert_eq!(node.blocks[1].key, 10);
        assert_eq!(node.blocks[2].key, 20);
    }

    #[test]
    fn put_in_node_rejects_duplicate_key() {
        let (mut fm, _dir, node_id) = tmp_node();
        put_in_node(&mut fm, node_id, 1, b"a", 0, false).unwrap();
        let err = put_in_node(&mut fm, node_id, 1, b"b", 0, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::KeyDuplicate(1))
        ));
    }

    #[test]
    fn delete_in_node_closes_the_hole() {
        let (mut fm, _dir, node_id) = tmp_node();
        put_in_node(&mut fm, node_id, 1, b"a", 0, false).unwrap();
        put_in_node(&mut fm, node_id, 2, b"b", 0, false).unwrap();
        put_in_node(&mut fm, node_id, 3, b"c", 0, false).unwrap();

        delete_in_node(&mut fm, node_id, 2, false).unwrap();

        assert!(read_from_node(&mut fm, node_id, 2).unwrap().is_none());
        let node = fm.read_node(node_id).unwrap();
        assert_eq!(node.block_size, 2);
        assert_eq!(node.blocks[0].key, 1);
        assert_eq!(node.blocks[1].key, 3);
    }

    #[test]
    fn delete_in_node_drops_correct_child_by_direction() {
        let (mut fm, _dir, node_id) = tmp_node();
        // seed children around key 10: left child 100, right child 200
        let mut node = fm.read_node(node_id).unwrap();
        node.children[0] = 100;
        fm.save_node(node_id, &node).unwrap();
        put_in_node(&mut fm, node_id, 10, b"ten", 200, false).unwrap();

        let node = fm.read_node(node_id).unwrap();
        assert_eq!(node.children[0], 100);
        assert_eq!(node.children[1], 200);

        delete_in_node(&mut fm, node_id, 10, true).unwrap();
        let node = fm.read_node(node_id).unwrap();
        // the left child (100) should have been dropped, right child (200) remains
        assert_eq!(node.children[0], 200);
    }

    #[test]
    fn binary_index_node_reports_insertion_point_for_missing_keys() {
        let (mut fm, _dir, node_id) = tmp_node();
        put_in_node(&mut fm, node_id, 10, b"ten", 0, false).unwrap();
        put_in_node(&mut fm, node_id, 30, b"thirty", 0, false).unwrap();

        let node = fm.read_node(node_id).unwrap();
        assert_eq!(binary_index_node(&node, 20), Err(1));
        assert_eq!(binary_index_node(&node, 5), Err(0));
        assert_eq!(binary_index_node(&node, 10), Ok(0));
    }
}
