//! B-Tree over NodePages (C6): search, insert with split, delete with
//! borrow/merge rebalancing. Degree `MAX_DEGREE`, minimum occupancy
//! `MIN_BLOCK_SIZE`.

use crate::data_page;
use crate::error::EngineError;
use crate::file_manager::{FileManager, NewPageKind};
use crate::node;
use crate::page::{NodeCell, MAX_DEGREE, MIN_BLOCK_SIZE};
use anyhow::Result;
use log::debug;

pub fn search(fm: &mut FileManager, node_id: u32, key: u32) -> Result<Option<Vec<u8>>> {
    if node_id == 0 {
        return Ok(None);
    }
    let n = fm.read_node(node_id)?;
    match node::binary_index_node(&n, key) {
        Ok(i) => Ok(Some(data_page::read(fm, n.data_page_id, n.blocks[i].offset)?)),
        Err(i) => {
            let child = n.children[i];
            if child == 0 {
                Ok(None)
            } else {
                search(fm, child, key)
            }
        }
    }
}

/// Split a full node in two, returning `(promoted_key, promoted_value, right_sibling_id)`.
fn split(fm: &mut FileManager, node_id: u32) -> Result<(u32, Vec<u8>, u32)> {
    let n = fm.read_node(node_id)?;
    if n.block_size as usize != MAX_DEGREE {
        return Err(EngineError::corrupt(format!(
            "split: node {} is not full (block_size={})",
            node_id, n.block_size
        ))
        .into());
    }
    let mid = MAX_DEGREE / 2;
    let push_key = n.blocks[mid].key;
    let push_data = data_page::read(fm, n.data_page_id, n.blocks[mid].offset)?;

    // snapshot everything past mid before any mutation touches this node
    let mut moves = Vec::with_capacity(MAX_DEGREE - mid - 1);
    for i in (mid + 1)..MAX_DEGREE {
        let data = data_page::read(fm, n.data_page_id, n.blocks[i].offset)?;
        moves.push((n.blocks[i].key, data, n.children[i + 1]));
    }
    let leftmost_moved_child = n.children[mid + 1];

    let right_id = fm.make_page(NewPageKind::Node)?;
    for (key, data, right_child) in &moves {
        node::put_in_node(fm, right_id, *key, data, *right_child, false)?;
    }
    let mut right = fm.read_node(right_id)?;
    right.children[0] = leftmost_moved_child;
    fm.save_node(right_id, &right)?;

    for (key, _, _) in &moves {
        node::delete_in_node(fm, node_id, *key, false)?;
    }
    // removing blocks[mid] also drops children[mid+1] (already relocated above)
    node::delete_in_node(fm, node_id, push_key, false)?;

    debug!("split: node {} -> promoted key {}, new right sibling {}", node_id, push_key, right_id);
    Ok((push_key, push_data, right_id))
}

enum InsertOutcome {
    Done,
    Duplicate,
    Overflow { key: u32, data: Vec<u8>, new_node_id: u32 },
}

fn insert_helper(fm: &mut FileManager, node_id: u32, key: u32, value: &[u8]) -> Result<InsertOutcome> {
    let n = fm.read_node(node_id)?;
    let is_leaf = n.children[0] == 0;

    if is_leaf {
        if node::binary_index_node(&n, key).is_ok() {
            return Ok(InsertOutcome::Duplicate);
        }
        node::put_in_node(fm, node_id, key, value, 0, false)?;
        let n = fm.read_node(node_id)?;
        if n.block_size as usize == MAX_DEGREE {
            let (pk, pd, new_id) = split(fm, node_id)?;
            return Ok(InsertOutcome::Overflow { key: pk, data: pd, new_node_id: new_id });
        }
        return Ok(InsertOutcome::Done);
    }

    match node::binary_index_node(&n, key) {
        Ok(_) => Ok(InsertOutcome::Duplicate),
        Err(i) => {
            let child = n.children[i];
            match insert_helper(fm, child, key, value)? {
                InsertOutcome::Done => Ok(InsertOutcome::Done),
                InsertOutcome::Duplicate => Ok(InsertOutcome::Duplicate),
                InsertOutcome::Overflow { key: pk, data: pd, new_node_id } => {
                    node::put_in_node(fm, node_id, pk, &pd, new_node_id, false)?;
                    let n = fm.read_node(node_id)?;
                    if n.block_size as usize == MAX_DEGREE {
                        let (pk2, pd2, new_id2) = split(fm, node_id)?;
                        Ok(InsertOutcome::Overflow { key: pk2, data: pd2, new_node_id: new_id2 })
                    } else {
                        Ok(InsertOutcome::Done)
                    }
                }
            }
        }
    }
}

/// Insert `(key, value)`. Duplicates are silently ignored and do not
/// affect `total_data_size` -- the bump happens only inside
/// `data_page::put`, which is never reached on the duplicate path.
pub fn insert(fm: &mut FileManager, key: u32, value: &[u8]) -> Result<()> {
    if fm.header.root_node_id == 0 {
        let root_id = fm.make_page(NewPageKind::Node)?;
        fm.header.root_node_id = root_id;
    }
    let root_id = fm.header.root_node_id;
    match insert_helper(fm, root_id, key, value)? {
        InsertOutcome::Duplicate => Ok(()),
        InsertOutcome::Done => Ok(()),
        InsertOutcome::Overflow { key: pk, data: pd, new_node_id } => {
            let new_root_id = fm.make_page(NewPageKind::Node)?;
            node::put_in_node(fm, new_root_id, pk, &pd, root_id, true)?;
            let mut new_root = fm.read_node(new_root_id)?;
            new_root.children[1] = new_node_id;
            fm.save_node(new_root_id, &new_root)?;
            fm.header.root_node_id = new_root_id;
            debug!("insert: root split, new root {}", new_root_id);
            Ok(())
        }
    }
}

fn find_leftmost(fm: &mut FileManager, node_id: u32) -> Result<(u32, Vec<u8>)> {
    let n = fm.read_node(node_id)?;
    if n.children[0] == 0 {
        let data = data_page::read(fm, n.data_page_id, n.blocks[0].offset)?;
        Ok((n.blocks[0].key, data))
    } else {
        find_leftmost(fm, n.children[0])
    }
}

enum DeleteStatus {
    NotFound,
    Ok,
    Underflow,
}

fn delete_helper(fm: &mut FileManager, node_id: u32, key: u32) -> Result<DeleteStatus> {
    let n = fm.read_node(node_id)?;
    let is_leaf = n.children[0] == 0;

    match node::binary_index_node(&n, key) {
        Ok(idx) => {
            if is_leaf {
                node::delete_in_node(fm, node_id, key, false)?;
            } else {
                let right_child = n.children[idx + 1];
                let (succ_key, succ_data) = find_leftmost(fm, right_child)?;
                node::delete_in_node(fm, node_id, key, false)?;
                node::put_in_node(fm, node_id, succ_key, &succ_data, right_child, false)?;
                let status = delete_helper(fm, right_child, succ_key)?;
                if let DeleteStatus::Underflow = status {
                    let n_now = fm.read_node(node_id)?;
                    let child_idx = match node::binary_index_node(&n_now, succ_key) {
                        Ok(i) => i + 1,
                        Err(_) => {
                            return Err(EngineError::corrupt(
                                "delete_helper: successor key vanished from parent",
                            )
                            .into())
                        }
                    };
                    merge(fm, node_id, child_idx)?;
                }
            }
        }
        Err(i) => {
            let child = n.children[i];
            if child == 0 {
                return Ok(DeleteStatus::NotFound);
            }
            match delete_helper(fm, child, key)? {
                DeleteStatus::Underflow => merge(fm, node_id, i)?,
                DeleteStatus::NotFound => return Ok(DeleteStatus::NotFound),
                DeleteStatus::Ok => {}
            }
        }
    }

    let n = fm.read_node(node_id)?;
    if (n.block_size as usize) < MIN_BLOCK_SIZE {
        Ok(DeleteStatus::Underflow)
    } else {
        Ok(DeleteStatus::Ok)
    }
}

/// Rotate `child`'s first entry in from its right sibling.
fn borrow_from_right(fm: &mut FileManager, parent_id: u32, child_idx: usize) -> Result<()> {
    let parent = fm.read_node(parent_id)?;
    let child_id = parent.children[child_idx];
    let right_id = parent.children[child_idx + 1];
    let right = fm.read_node(right_id)?;

    let sibling_first_key = right.blocks[0].key;
    let sibling_first_data = data_page::read(fm, right.data_page_id, right.blocks[0].offset)?;
    let sibling_first_child = right.children[0];

    // (a) drop the sibling's first entry along with its left child
    node::delete_in_node(fm, right_id, sibling_first_key, true)?;

    // (b) pull the separator out of the parent
    let parent_sep_key = parent.blocks[child_idx].key;
    let parent_sep_data = data_page::read(fm, parent.data_page_id, parent.blocks[child_idx].offset)?;
    node::delete_in_node(fm, parent_id, parent_sep_key, false)?;

    // (c) the sibling's old first key takes the separator's place in the parent
    node::put_in_node(fm, parent_id, sibling_first_key, &sibling_first_data, right_id, false)?;

    // (d) the old separator becomes the child's new rightmost entry
    node::put_in_node(fm, child_id, parent_sep_key, &parent_sep_data, sibling_first_child, false)?;

    Ok(())
}

/// Rotate `child`'s last entry in from its left sibling.
fn borrow_from_left(fm: &mut FileManager, parent_id: u32, child_idx: usize) -> Result<()> {
    let parent = fm.read_node(parent_id)?;
    let child_id = parent.children[child_idx];
    let left_id = parent.children[child_idx - 1];
    let left = fm.read_node(left_id)?;

    let lb = left.block_size as usize;
    let sibling_last_key = left.blocks[lb - 1].key;
    let sibling_last_data = data_page::read(fm, left.data_page_id, left.blocks[lb - 1].offset)?;
    let sibling_last_child = left.children[lb];

    // (a) drop the sibling's last entry along with its right child
    node::delete_in_node(fm, left_id, sibling_last_key, false)?;

    // (b) pull the separator out of the parent
    let parent_sep_key = parent.blocks[child_idx - 1].key;
    let parent_sep_data = data_page::read(fm, parent.data_page_id, parent.blocks[child_idx - 1].offset)?;
    node::delete_in_node(fm, parent_id, parent_sep_key, true)?;

    // (c) the sibling's old last key takes the separator's place in the parent
    node::put_in_node(fm, parent_id, sibling_last_key, &sibling_last_data, left_id, true)?;

    // (d) the old separator becomes the child's new leftmost entry
    node::put_in_node(fm, child_id, parent_sep_key, &parent_sep_data, sibling_last_child, true)?;

    Ok(())
}

/// Concatenate `right_id`'s keys and children onto `left_id`, pulling
/// `parent.blocks[sep_idx]` down as the connecting key, and delete
/// `right_id`.
fn merge_chain(fm: &mut FileManager, parent_id: u32, sep_idx: usize, left_id: u32, right_id: u32) -> Result<()> {
    let parent = fm.read_node(parent_id)?;
    let left0 = fm.read_node(left_id)?;
    let right0 = fm.read_node(right_id)?;

    let sep_key = parent.blocks[sep_idx].key;
    let sep_data = data_page::read(fm, parent.data_page_id, parent.blocks[sep_idx].offset)?;

    let rb = right0.block_size as usize;
    let mut right_entries = Vec::with_capacity(rb);
    for i in 0..rb {
        let data = data_page::read(fm, right0.data_page_id, right0.blocks[i].offset)?;
        right_entries.push((right0.blocks[i].key, data));
    }
    let right_children: Vec<u32> = right0.children[..=rb].to_vec();
    let left_data_page_id = left0.data_page_id;

    let sep_new_offset = data_page::put(fm, left_data_page_id, &sep_data)?;
    let mut left = fm.read_node(left_id)?;
    let mut lb = left.block_size as usize;
    left.blocks[lb] = NodeCell { key: sep_key, offset: sep_new_offset };
    lb += 1;
    left.block_size = lb as u16;
    fm.save_node(left_id, &left)?;

    for (key, data) in &right_entries {
        let new_offset = data_page::put(fm, left_data_page_id, data)?;
        let mut left = fm.read_node(left_id)?;
        let lb = left.block_size as usize;
        left.blocks[lb] = NodeCell { key: *key, offset: new_offset };
        left.block_size = (lb + 1) as u16;
        fm.save_node(left_id, &left)?;
    }

    let mut left = fm.read_node(left_id)?;
    let base = left0.block_size as usize + 1;
    for (i, child) in right_children.iter().enumerate() {
        left.children[base + i] = *child;
    }
    fm.save_node(left_id, &left)?;

    fm.delete_page(right_id)?;
    node::delete_in_node(fm, parent_id, sep_key, false)?;

    debug!("merge_chain: absorbed node {} into {}", right_id, left_id);
    Ok(())
}

/// Rebalance `parent.children[child_idx]`, which just dropped below the
/// minimum occupancy.
fn merge(fm: &mut FileManager, parent_id: u32, child_idx: usize) -> Result<()> {
    let parent = fm.read_node(parent_id)?;
    let child_id = parent.children[child_idx];
    let child = fm.read_node(child_id)?;
    if child.block_size as usize >= MIN_BLOCK_SIZE {
        return Ok(());
    }

    let block_size = parent.block_size as usize;
    let has_right = child_idx < block_size;
    let has_left = child_idx > 0;

    if has_right {
        let right_id = parent.children[child_idx + 1];
        let right = fm.read_node(right_id)?;
        if right.block_size as usize > MIN_BLOCK_SIZE {
            return borrow_from_right(fm, parent_id, child_idx);
        }
    }
    if has_left {
        let left_id = parent.children[child_idx - 1];
        let left = fm.read_node(left_id)?;
        if left.block_size as usize > MIN_BLOCK_SIZE {
            return borrow_from_left(fm, parent_id, child_idx);
        }
    }
    if has_left {
        merge_chain(fm, parent_id, child_idx - 1, parent.children[child_idx - 1], child_id)
    } else {
        let right_id = parent.children[child_idx + 1];
        merge_chain(fm, parent_id, child_idx, child_id, right_id)
    }
}

/// Delete `key`. Fails with `KeyNotFound` if absent.
pub fn delete(fm: &mut FileManager, key: u32) -> Result<()> {
    let root_id = fm.header.root_node_id;
    if root_id == 0 || search(fm, root_id, key)?.is_none() {
        return Err(EngineError::KeyNotFound(key).into());
    }

    delete_helper(fm, root_id, key)?;

    let root = fm.read_node(root_id)?;
    if root.block_size == 0 {
        let new_root = root.children[0];
        fm.delete_page(root_id)?;
        fm.header.root_node_id = new_root;
        debug!("delete: root {} collapsed, new root {}", root_id, new_root);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_fm() -> (FileManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create(dir.path().join("test.db")).unwrap();
        (fm, dir)
    }

    fn val(key: u32) -> Vec<u8> {
        format!("value-{key}").into_bytes()
    }

    #[test]
    fn insert_then_search_round_trips() {
        let (mut fm, _dir) = tmp_fm();
        for k in [10, 5, 20, 15, 1] {
            insert(&mut fm, k, &val(k)).unwrap();
        }
        for k in [10, 5, 20, 15, 1] {
            let root = fm.header.root_node_id;
            assert_eq!(search(&mut fm, root, k).unwrap().unwrap(), val(k));
        }
        let root = fm.header.root_node_id;
        assert!(search(&mut fm, root, 999).unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_a_silent_no_op() {
        let (mut fm, _dir) = tmp_fm();
        insert(&mut fm, 1, b"first").unwrap();
        let size_after_first = fm.header.total_data_size;
        insert(&mut fm, 1, b"second").unwrap();
        assert_eq!(fm.header.total_data_size, size_after_first);
        let root = fm.header.root_node_id;
        assert_eq!(search(&mut fm, root, 1).unwrap().unwrap(), b"first");
    }

    #[test]
    fn delete_on_absent_key_errors() {
        let (mut fm, _dir) = tmp_fm();
        insert(&mut fm, 1, b"a").unwrap();
        let err = delete(&mut fm, 42).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::KeyNotFound(42))
        ));
    }

    #[test]
    fn delete_removes_key_and_reclaims_space() {
        let (mut fm, _dir) = tmp_fm();
        insert(&mut fm, 1, b"a").unwrap();
        insert(&mut fm, 2, b"b").unwrap();
        delete(&mut fm, 1).unwrap();

        let root = fm.header.root_node_id;
        assert!(search(&mut fm, root, 1).unwrap().is_none());
        assert_eq!(search(&mut fm, root, 2).unwrap().unwrap(), b"b");
        assert_eq!(fm.header.total_data_size, 1);
    }

    #[test]
    fn deleting_the_last_key_collapses_root_to_zero() {
        let (mut fm, _dir) = tmp_fm();
        insert(&mut fm, 1, b"only").unwrap();
        delete(&mut fm, 1).unwrap();
        assert_eq!(fm.header.root_node_id, 0);
    }

    #[test]
    fn delete_on_empty_tree_errors() {
        let (mut fm, _dir) = tmp_fm();
        let err = delete(&mut fm, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::KeyNotFound(1))
        ));
    }

    #[test]
    fn many_inserts_force_a_root_split() {
        let (mut fm, _dir) = tmp_fm();
        let n = (MAX_DEGREE as u32) + 50;
        for k in 0..n {
            insert(&mut fm, k, &val(k)).unwrap();
        }
        let root = fm.header.root_node_id;
        let root_node = fm.read_node(root).unwrap();
        assert!(root_node.block_size >= 1, "root should carry at least the promoted key");
        assert!(root_node.children[0] != 0, "a split root is never a leaf");

        for k in [0, n / 2, n - 1] {
            assert_eq!(search(&mut fm, root, k).unwrap().unwrap(), val(k));
        }
    }

    #[test]
    fn deletes_after_many_inserts_trigger_rebalancing() {
        let (mut fm, _dir) = tmp_fm();
        let n = (MAX_DEGREE as u32) + 50;
        for k in 0..n {
            insert(&mut fm, k, &val(k)).unwrap();
        }
        for k in 0..n {
            if k % 3 == 0 {
                delete(&mut fm, k).unwrap();
            }
        }
        let root = fm.header.root_node_id;
        for k in 0..n {
            let found = search(&mut fm, root, k).unwrap();
            if k % 3 == 0 {
                assert!(found.is_none(), "key {k} should have been deleted");
            } else {
                assert_eq!(found.unwrap(), val(k));
            }
        }

        let expected: u64 = (0..n)
            .filter(|k| k % 3 != 0)
            .map(|k| val(k).len() as u64)
            .sum();
        assert_eq!(
            fm.header.total_data_size, expected,
            "total_data_size must equal the sum of surviving values' raw lengths even after node merges"
        );
    }
}
