//! Block-paged KV cache engine (§4.3): a fixed pool of fixed-size
//! blocks, an LRU free list that keeps evicted blocks' content hashes
//! alive for later prefix hits, and a content-addressed prefix cache.
//!
//! `allocate` is transactional: on failure the pool is left bit-
//! identical to how it looked on entry (§8, "Allocation atomicity").

use std::collections::{HashMap, VecDeque};

use blis_types::{KvBlockId, KvConfig, RequestId};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type ContentHash = [u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("kv pool exhausted for request {request}: short by {shortfall} tokens of capacity")]
    Exhausted { request: RequestId, shortfall: usize },
}

#[derive(Clone, Copy, Debug)]
struct Block {
    filled: u32,
    hash: Option<ContentHash>,
    refcount: u32,
    in_free_list: bool,
}

impl Block {
    fn empty() -> Self {
        Self {
            filled: 0,
            hash: None,
            refcount: 0,
            in_free_list: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RequestAllocation {
    blocks: Vec<KvBlockId>,
    filled_tokens: usize,
}

/// Result of a successful `allocate` call.
#[derive(Clone, Debug, Default)]
pub struct AllocateOutcome {
    pub new_blocks: Vec<KvBlockId>,
    pub reused_cached_blocks: usize,
    pub tokens_appended: usize,
}

enum UndoAction {
    ReuseCached {
        id: KvBlockId,
        was_free_with_hash: Option<ContentHash>,
    },
    ShrinkBlock {
        id: KvBlockId,
        filled_before: u32,
    },
    PopBlock {
        id: KvBlockId,
        evicted_hash: Option<ContentHash>,
    },
    RegisterHash {
        hash: ContentHash,
    },
}

pub struct KvCache {
    config: KvConfig,
    blocks: Vec<Block>,
    free_list: VecDeque<KvBlockId>,
    hash_to_block: HashMap<ContentHash, KvBlockId>,
    requests: HashMap<RequestId, RequestAllocation>,
}

impl KvCache {
    pub fn new(config: KvConfig) -> Self {
        let total = config.total_blocks as usize;
        let blocks = vec![Block::empty(); total];
        let free_list = (0..total as u32).map(KvBlockId).collect();
        Self {
            config,
            blocks,
            free_list,
            hash_to_block: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn config(&self) -> KvConfig {
        self.config
    }

    pub fn in_use_blocks(&self) -> u32 {
        self.blocks.iter().filter(|b| b.refcount > 0).count() as u32
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_list.len() as u32
    }

    /// Debug/test helper for the KV conservation invariant (§3, §8).
    pub fn check_conservation(&self) -> bool {
        self.in_use_blocks() + self.free_blocks() == self.config.total_blocks
    }

    pub fn kv_utilization(&self) -> f64 {
        self.in_use_blocks() as f64 / self.config.total_blocks as f64
    }

    pub fn owned_blocks(&self, request: RequestId) -> &[KvBlockId] {
        self.requests
            .get(&request)
            .map(|a| a.blocks.as_slice())
            .unwrap_or(&[])
    }

    pub fn tokens_resident(&self, request: RequestId) -> usize {
        self.requests.get(&request).map(|a| a.filled_tokens).unwrap_or(0)
    }

    /// Pure query: longest run of block-sized chunks of `tokens` whose
    /// cumulative-prefix hashes are all present in the prefix cache.
    pub fn lookup_prefix(&self, tokens: &[u32]) -> Vec<KvBlockId> {
        let block_size = self.config.block_size as usize;
        let mut hits = Vec::new();
        let mut end = block_size;
        while end <= tokens.len() {
            let hash = hash_prefix(&tokens[..end]);
            match self.hash_to_block.get(&hash) {
                Some(&id) if self.blocks[id.0 as usize].hash == Some(hash) => {
                    hits.push(id);
                    end += block_size;
                }
                _ => break,
            }
        }
        hits
    }

    /// Allocates KV blocks to cover `new_token_count` additional tokens
    /// for `request`, reusing `cached_block_ids` (from a prior
    /// `lookup_prefix`) on a request's first call. `input_tokens` is the
    /// request's full, stable input sequence, used only to compute
    /// content hashes for blocks that land entirely within it.
    pub fn allocate(
        &mut self,
        request: RequestId,
        input_tokens: &[u32],
        new_token_count: usize,
        cached_block_ids: &[KvBlockId],
    ) -> Result<AllocateOutcome, KvError> {
        let block_size = self.config.block_size as usize;
        let is_new_request = !self.requests.contains_key(&request);
        let mut undo: Vec<UndoAction> = Vec::new();

        if is_new_request {
            for &id in cached_block_ids {
                self.reuse_cached_block(id, &mut undo);
            }
        }

        let mut alloc = if is_new_request {
            RequestAllocation {
                blocks: cached_block_ids.to_vec(),
                filled_tokens: cached_block_ids.len() * block_size,
            }
        } else {
            self.requests.get(&request).cloned().unwrap_or_default()
        };

        let start_cursor = alloc.filled_tokens;
        let target = start_cursor + new_token_count;
        let mut cursor = start_cursor;
        let mut new_blocks_this_call = Vec::new();

        // Step 2: extend the existing non-full latest block, if any.
        if let Some(&last_id) = alloc.blocks.last() {
            let remaining_capacity = block_size - self.blocks[last_id.0 as usize].filled as usize;
            if remaining_capacity > 0 && cursor < target {
                let to_fill = remaining_capacity.min(target - cursor);
                let filled_before = self.blocks[last_id.0 as usize].filled;
                self.blocks[last_id.0 as usize].filled += to_fill as u32;
                undo.push(UndoAction::ShrinkBlock { id: last_id, filled_before });
                cursor += to_fill;
                self.maybe_register_hash(last_id, cursor, input_tokens, &mut undo);
            }
        }

        // Step 3: allocate fresh blocks for the remainder.
        let mut shortfall: Option<usize> = None;
        while cursor < target {
            let Some((new_id, evicted_hash)) = self.pop_free() else {
                shortfall = Some(target - cursor);
                break;
            };
            undo.push(UndoAction::PopBlock { id: new_id, evicted_hash });

            let take = block_size.min(target - cursor);
            {
                let blk = &mut self.blocks[new_id.0 as usize];
                blk.filled = take as u32;
                blk.refcount = 1;
                blk.hash = None;
                blk.in_free_list = false;
            }
            new_blocks_this_call.push(new_id);
            cursor += take;
            self.maybe_register_hash(new_id, cursor, input_tokens, &mut undo);
        }

        if let Some(shortfall) = shortfall {
            self.rollback(undo);
            return Err(KvError::Exhausted { request, shortfall });
        }

        alloc.blocks.extend(new_blocks_this_call.clone());
        alloc.filled_tokens = cursor;
        let outcome = AllocateOutcome {
            new_blocks: new_blocks_this_call,
            reused_cached_blocks: if is_new_request { cached_block_ids.len() } else { 0 },
            tokens_appended: cursor - start_cursor,
        };
        self.requests.insert(request, alloc);
        Ok(outcome)
    }

    /// Releases all blocks owned by `request`; blocks whose refcount
    /// reaches zero are returned to the tail of the free list with
    /// their hash and fill state intact, so a later identical prefix
    /// can still hit.
    pub fn release(&mut self, request: RequestId) {
        let Some(alloc) = self.requests.remove(&request) else {
            return;
        };
        for id in alloc.blocks {
            let blk = &mut self.blocks[id.0 as usize];
            debug_assert!(blk.refcount > 0, "release of a block with refcount 0 is a kernel bug");
            blk.refcount -= 1;
            if blk.refcount == 0 {
                blk.in_free_list = true;
                self.free_list.push_back(id);
            }
        }
    }

    fn reuse_cached_block(&mut self, id: KvBlockId, undo: &mut Vec<UndoAction>) {
        let was_free = self.blocks[id.0 as usize].in_free_list;
        let hash_before = self.blocks[id.0 as usize].hash;
        if was_free {
            self.remove_from_free_list(id);
            self.blocks[id.0 as usize].in_free_list = false;
        }
        self.blocks[id.0 as usize].refcount += 1;
        undo.push(UndoAction::ReuseCached {
            id,
            was_free_with_hash: if was_free { hash_before } else { None },
        });
    }

    fn remove_from_free_list(&mut self, id: KvBlockId) {
        if let Some(pos) = self.free_list.iter().position(|&x| x == id) {
            self.free_list.remove(pos);
        }
    }

    fn pop_free(&mut self) -> Option<(KvBlockId, Option<ContentHash>)> {
        let id = self.free_list.pop_front()?;
        let blk = &mut self.blocks[id.0 as usize];
        let evicted_hash = blk.hash.take();
        if let Some(h) = evicted_hash {
            self.hash_to_block.remove(&h);
        }
        blk.in_free_list = false;
        Some((id, evicted_hash))
    }

    fn maybe_register_hash(
        &mut self,
        id: KvBlockId,
        abs_end: usize,
        input_tokens: &[u32],
        undo: &mut Vec<UndoAction>,
    ) {
        let block_size = self.config.block_size as usize;
        let blk = &self.blocks[id.0 as usize];
        if blk.filled as usize != block_size || blk.hash.is_some() {
            return;
        }
        if abs_end > input_tokens.len() {
            return; // spans past the input region: not prefix-cacheable
        }
        let hash = hash_prefix(&input_tokens[..abs_end]);
        self.blocks[id.0 as usize].hash = Some(hash);
        self.hash_to_block.insert(hash, id);
        undo.push(UndoAction::RegisterHash { hash });
    }

    fn rollback(&mut self, undo: Vec<UndoAction>) {
        for action in undo.into_iter().rev() {
            match action {
                UndoAction::ReuseCached { id, was_free_with_hash } => {
                    let blk = &mut self.blocks[id.0 as usize];
                    blk.refcount -= 1;
                    if let Some(hash) = was_free_with_hash {
                        blk.in_free_list = true;
                        blk.hash = Some(hash);
                        self.hash_to_block.insert(hash, id);
                        self.free_list.push_front(id);
                    }
                }
                UndoAction::ShrinkBlock { id, filled_before } => {
                    self.blocks[id.0 as usize].filled = filled_before;
                }
                UndoAction::PopBlock { id, evicted_hash } => {
                    let blk = &mut self.blocks[id.0 as usize];
                    blk.refcount = 0;
                    blk.filled = 0;
                    blk.in_free_list = true;
                    blk.hash = evicted_hash;
                    if let Some(h) = evicted_hash {
                        self.hash_to_block.insert(h, id);
                    }
                    self.free_list.push_front(id);
                }
                UndoAction::RegisterHash { hash } => {
                    self.hash_to_block.remove(&hash);
                }
            }
        }
    }
}

fn hash_prefix(tokens: &[u32]) -> ContentHash {
    let mut hasher = Sha256::new();
    for t in tokens {
        hasher.update(t.to_le_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_types::RequestId;

    fn cfg(total_blocks: u32, block_size: u32) -> KvConfig {
        KvConfig { total_blocks, block_size }
    }

    #[test]
    fn single_request_allocates_full_and_partial_blocks() {
        let mut kv = KvCache::new(cfg(64, 4));
        let req = RequestId::new_v4();
        let input: Vec<u32> = (0..10).collect();
        let out = kv.allocate(req, &input, 10, &[]).unwrap();
        assert_eq!(out.new_blocks.len(), 3); // 4 + 4 + 2
        assert_eq!(out.tokens_appended, 10);
        assert_eq!(kv.tokens_resident(req), 10);
        assert_eq!(kv.in_use_blocks(), 3);
        assert!(kv.check_conservation());
    }

    #[test]
    fn prefix_reuse_shares_full_blocks_between_requests() {
        let mut kv = KvCache::new(cfg(64, 16));
        let shared_prefix: Vec<u32> = (0..32).collect();

        let r1 = RequestId::new_v4();
        kv.allocate(r1, &shared_prefix, 32, &[]).unwrap();
        kv.release(r1);
        assert_eq!(kv.in_use_blocks(), 0, "blocks return to the free list, not vanish");

        let r2 = RequestId::new_v4();
        let hits = kv.lookup_prefix(&shared_prefix);
        assert_eq!(hits.len(), 2, "both 16-token blocks should hit");
        // Net-new tokens beyond what the cache hit already covers: the
        // full 32-token prefix is covered by the 2 cached blocks, so 0.
        let out = kv.allocate(r2, &shared_prefix, 0, &hits).unwrap();
        assert_eq!(out.reused_cached_blocks, 2);
        assert_eq!(out.new_blocks.len(), 0);
    }

    #[test]
    fn allocation_failure_is_atomic() {
        let mut kv = KvCache::new(cfg(2, 4));
        let filler = RequestId::new_v4();
        let filler_tokens: Vec<u32> = (0..8).collect();
        kv.allocate(filler, &filler_tokens, 8, &[]).unwrap();
        assert_eq!(kv.free_blocks(), 0);

        let snapshot_in_use = kv.in_use_blocks();
        let snapshot_free = kv.free_blocks();

        let victim = RequestId::new_v4();
        let victim_tokens: Vec<u32> = (0..4).collect();
        let err = kv.allocate(victim, &victim_tokens, 4, &[]).unwrap_err();
        assert_eq!(err, KvError::Exhausted { request: victim, shortfall: 4 });

        assert_eq!(kv.in_use_blocks(), snapshot_in_use);
        assert_eq!(kv.free_blocks(), snapshot_free);
        assert_eq!(kv.tokens_resident(victim), 0);
    }

    #[test]
    fn decode_tokens_never_get_hashed_into_the_prefix_cache() {
        let mut kv = KvCache::new(cfg(64, 4));
        let req = RequestId::new_v4();
        let input: Vec<u32> = (0..4).collect(); // exactly one block of input
        kv.allocate(req, &input, 4, &[]).unwrap();
        // now decode: one token at a time, well past the input boundary
        for _ in 0..4 {
            kv.allocate(req, &input, 1, &[]).unwrap();
        }
        // a second request with the same 4-token input should still hit exactly one block
        let hits = kv.lookup_prefix(&input);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn release_preserves_hash_until_eviction() {
        let mut kv = KvCache::new(cfg(2, 4));
        let r1 = RequestId::new_v4();
        let tokens: Vec<u32> = (0..4).collect();
        kv.allocate(r1, &tokens, 4, &[]).unwrap();
        kv.release(r1);

        // Still a hit: block sits on the free list with its hash intact.
        assert_eq!(kv.lookup_prefix(&tokens).len(), 1);

        // Force eviction by allocating two fresh, unrelated blocks.
        let other = RequestId::new_v4();
        let other_tokens: Vec<u32> = (100..108).collect();
        kv.allocate(other, &other_tokens, 8, &[]).unwrap();

        assert_eq!(kv.lookup_prefix(&tokens).len(), 0, "evicted block's hash is gone");
    }
}
