//! Database key layout and typed accessors.
//!
//! All chain data is stored under single-byte key prefixes; head markers and
//! maintenance cursors use short named keys. Reads transparently fall back to
//! the ancient segment for frozen history.

use crate::{ChainDb, KeyValueStore, StoreError, WriteBatch, IDEAL_BATCH_SIZE};
use alloy_rlp::Decodable;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use trellis_primitives::{
    BlockHash, BlockNumber, Body, DiffLayer, Header, Receipt, SealedBlock, SealedHeader, TxHash,
    B256, U256,
};

/// Current version of the database layout.
///
/// A mismatch on open forces a resync from scratch. The layout follows the
/// upstream lineage up to version 8 (tx lookups store block numbers, frozen
/// history lives in the ancient segment, codes are stored separately from
/// trie nodes).
pub const CHAIN_DB_VERSION: u64 = 8;

const HEADER_PREFIX: u8 = b'h';
const HEADER_NUMBER_PREFIX: u8 = b'H';
const BODY_PREFIX: u8 = b'b';
const RECEIPTS_PREFIX: u8 = b'r';
const TD_PREFIX: u8 = b't';
const CANONICAL_PREFIX: u8 = b'c';
const TX_LOOKUP_PREFIX: u8 = b'l';
const BAD_BLOCK_PREFIX: u8 = b'B';
const DIFF_LAYER_PREFIX: u8 = b'd';
const STATE_PREFIX: u8 = b's';
const PREIMAGE_PREFIX: u8 = b'P';

const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
const HEAD_FAST_BLOCK_KEY: &[u8] = b"LastFast";
const SNAPSHOT_ROOT_KEY: &[u8] = b"SnapshotRoot";
const SNAPSHOT_RECOVERY_KEY: &[u8] = b"SnapshotRecovery";
const SAFE_POINT_KEY: &[u8] = b"SafePoint";
const LAST_PIVOT_KEY: &[u8] = b"LastPivot";
const TX_INDEX_TAIL_KEY: &[u8] = b"TxIndexTail";
const DB_VERSION_KEY: &[u8] = b"DatabaseVersion";

fn num_hash_key(prefix: u8, number: BlockNumber, hash: BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 32);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

fn num_key(prefix: u8, number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

fn hash_key(prefix: u8, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(prefix);
    key.extend_from_slice(hash.as_slice());
    key
}

fn decode<T: Decodable>(context: &'static str, value: Vec<u8>) -> Result<T, StoreError> {
    T::decode(&mut value.as_slice())
        .map_err(|err| StoreError::Corrupt { context, reason: err.to_string() })
}

// ---------- headers ----------

/// Queues a header write, including the hash-to-number index entry.
pub fn write_header(batch: &mut WriteBatch, header: &SealedHeader) {
    batch.put(
        num_hash_key(HEADER_PREFIX, header.number, header.hash()),
        alloy_rlp::encode(header.header()),
    );
    batch.put(hash_key(HEADER_NUMBER_PREFIX, header.hash()), header.number.to_be_bytes().to_vec());
}

/// Deletes a header and its hash-to-number index entry.
pub fn delete_header(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.delete(num_hash_key(HEADER_PREFIX, number, hash));
    batch.delete(hash_key(HEADER_NUMBER_PREFIX, hash));
}

/// Deletes only the hash-to-number index entry.
pub fn delete_header_number(batch: &mut WriteBatch, hash: BlockHash) {
    batch.delete(hash_key(HEADER_NUMBER_PREFIX, hash));
}

/// Deletes the header data while keeping the hash-to-number index entry,
/// for blocks whose data moved to the ancient segment.
pub fn delete_header_without_number(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.delete(num_hash_key(HEADER_PREFIX, number, hash));
}

/// Reads a header, falling back to the ancient segment.
pub fn read_header(
    db: &ChainDb,
    hash: BlockHash,
    number: BlockNumber,
) -> Result<Option<Header>, StoreError> {
    if let Some(value) = db.live().get(&num_hash_key(HEADER_PREFIX, number, hash))? {
        return decode::<Header>("header", value).map(Some);
    }
    if let Some(ancient) = db.ancient() {
        if ancient.hash(number) == Some(hash) {
            return Ok(ancient.header(number));
        }
    }
    Ok(None)
}

/// Reads the block number a hash belongs to.
pub fn read_header_number(db: &ChainDb, hash: BlockHash) -> Result<Option<BlockNumber>, StoreError> {
    if let Some(value) = db.live().get(&hash_key(HEADER_NUMBER_PREFIX, hash))? {
        let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            context: "header number",
            reason: format!("bad length {}", value.len()),
        })?;
        return Ok(Some(u64::from_be_bytes(bytes)));
    }
    Ok(db.ancient_number(hash))
}

/// Returns all `(number, hash)` pairs with a stored header in `first..=last`.
pub fn read_all_hashes_in_range(
    db: &ChainDb,
    first: BlockNumber,
    last: BlockNumber,
) -> Result<Vec<(BlockNumber, BlockHash)>, StoreError> {
    let from = num_key(HEADER_PREFIX, first);
    let to = num_key(HEADER_PREFIX, last.saturating_add(1));
    let mut out = Vec::new();
    for (key, _) in db.live().scan_range(&from, &to)? {
        if key.len() == 1 + 8 + 32 {
            let mut num = [0u8; 8];
            num.copy_from_slice(&key[1..9]);
            out.push((u64::from_be_bytes(num), BlockHash::from_slice(&key[9..])));
        }
    }
    Ok(out)
}

// ---------- bodies and receipts ----------

/// Queues a body write.
pub fn write_body(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash, body: &Body) {
    batch.put(num_hash_key(BODY_PREFIX, number, hash), alloy_rlp::encode(body));
}

/// Deletes a body.
pub fn delete_body(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.delete(num_hash_key(BODY_PREFIX, number, hash));
}

/// Reads a body, falling back to the ancient segment.
pub fn read_body(
    db: &ChainDb,
    hash: BlockHash,
    number: BlockNumber,
) -> Result<Option<Body>, StoreError> {
    if let Some(value) = db.live().get(&num_hash_key(BODY_PREFIX, number, hash))? {
        return decode::<Body>("body", value).map(Some);
    }
    if let Some(ancient) = db.ancient() {
        if ancient.hash(number) == Some(hash) {
            return Ok(ancient.body(number));
        }
    }
    Ok(None)
}

/// Queues a header + body write.
pub fn write_block(batch: &mut WriteBatch, block: &SealedBlock) {
    write_header(batch, &block.header);
    write_body(batch, block.number(), block.hash(), &block.body);
}

/// Queues a receipts write.
pub fn write_receipts(
    batch: &mut WriteBatch,
    number: BlockNumber,
    hash: BlockHash,
    receipts: &[Receipt],
) {
    let mut buf = Vec::new();
    alloy_rlp::encode_list(receipts, &mut buf);
    batch.put(num_hash_key(RECEIPTS_PREFIX, number, hash), buf);
}

/// Deletes receipts.
pub fn delete_receipts(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.delete(num_hash_key(RECEIPTS_PREFIX, number, hash));
}

/// Whether receipts are stored for the block, without decoding them.
pub fn has_receipts(db: &ChainDb, hash: BlockHash, number: BlockNumber) -> Result<bool, StoreError> {
    if db.live().get(&num_hash_key(RECEIPTS_PREFIX, number, hash))?.is_some() {
        return Ok(true);
    }
    Ok(db.ancient().is_some_and(|ancient| ancient.hash(number) == Some(hash)))
}

/// Reads receipts with block metadata (block number/hash, tx hashes) derived
/// from the containing block.
pub fn read_receipts(
    db: &ChainDb,
    hash: BlockHash,
    number: BlockNumber,
) -> Result<Option<Vec<Receipt>>, StoreError> {
    let raw = if let Some(value) = db.live().get(&num_hash_key(RECEIPTS_PREFIX, number, hash))? {
        decode::<Vec<Receipt>>("receipts", value)?
    } else if let Some(ancient) = db.ancient() {
        match ancient.hash(number) == Some(hash) {
            true => match ancient.receipts(number) {
                Some(receipts) => receipts,
                None => return Ok(None),
            },
            false => return Ok(None),
        }
    } else {
        return Ok(None);
    };

    let Some(body) = read_body(db, hash, number)? else {
        return Ok(Some(raw));
    };
    let mut receipts = raw;
    for (receipt, tx) in receipts.iter_mut().zip(body.transactions.iter()) {
        receipt.derive_fields(number, hash, tx.hash());
    }
    Ok(Some(receipts))
}

// ---------- total difficulty ----------

/// Queues a total-difficulty write.
pub fn write_td(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash, td: U256) {
    batch.put(num_hash_key(TD_PREFIX, number, hash), alloy_rlp::encode(&td));
}

/// Deletes a total-difficulty entry.
pub fn delete_td(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.delete(num_hash_key(TD_PREFIX, number, hash));
}

/// Reads a total difficulty, falling back to the ancient segment.
pub fn read_td(
    db: &ChainDb,
    hash: BlockHash,
    number: BlockNumber,
) -> Result<Option<U256>, StoreError> {
    if let Some(value) = db.live().get(&num_hash_key(TD_PREFIX, number, hash))? {
        return decode::<U256>("total difficulty", value).map(Some);
    }
    if let Some(ancient) = db.ancient() {
        if ancient.hash(number) == Some(hash) {
            return Ok(ancient.td(number));
        }
    }
    Ok(None)
}

// ---------- canonical mapping ----------

/// Queues a canonical-hash assignment.
pub fn write_canonical_hash(batch: &mut WriteBatch, number: BlockNumber, hash: BlockHash) {
    batch.put(num_key(CANONICAL_PREFIX, number), hash.as_slice().to_vec());
}

/// Deletes a canonical-hash assignment.
pub fn delete_canonical_hash(batch: &mut WriteBatch, number: BlockNumber) {
    batch.delete(num_key(CANONICAL_PREFIX, number));
}

/// Reads the canonical hash at `number`, falling back to the ancient segment.
pub fn read_canonical_hash(
    db: &ChainDb,
    number: BlockNumber,
) -> Result<Option<BlockHash>, StoreError> {
    if let Some(value) = db.live().get(&num_key(CANONICAL_PREFIX, number))? {
        if value.len() != 32 {
            return Err(StoreError::Corrupt {
                context: "canonical hash",
                reason: format!("bad length {}", value.len()),
            });
        }
        return Ok(Some(BlockHash::from_slice(&value)));
    }
    if let Some(ancient) = db.ancient() {
        return Ok(ancient.hash(number));
    }
    Ok(None)
}

// ---------- transaction lookups ----------

/// Queues tx-lookup entries for every transaction of a block.
pub fn write_tx_lookups(batch: &mut WriteBatch, block: &SealedBlock) {
    for tx in &block.body.transactions {
        batch.put(hash_key(TX_LOOKUP_PREFIX, tx.hash()), block.number().to_be_bytes().to_vec());
    }
}

/// Deletes a tx-lookup entry.
pub fn delete_tx_lookup(batch: &mut WriteBatch, tx_hash: TxHash) {
    batch.delete(hash_key(TX_LOOKUP_PREFIX, tx_hash));
}

/// Reads the block number a transaction was included in.
pub fn read_tx_lookup(db: &ChainDb, tx_hash: TxHash) -> Result<Option<BlockNumber>, StoreError> {
    let Some(value) = db.live().get(&hash_key(TX_LOOKUP_PREFIX, tx_hash))? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| StoreError::Corrupt {
        context: "tx lookup",
        reason: format!("bad length {}", value.len()),
    })?;
    Ok(Some(u64::from_be_bytes(bytes)))
}

/// Indexes the transactions of all canonical blocks in `from..to`.
///
/// Interruptible between blocks; progress made before an interrupt stays.
pub fn index_transactions(
    db: &ChainDb,
    from: BlockNumber,
    to: BlockNumber,
    interrupt: &AtomicBool,
) -> Result<(), StoreError> {
    let mut batch = WriteBatch::new();
    for number in from..to {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        let Some(hash) = read_canonical_hash(db, number)? else { continue };
        let Some(body) = read_body(db, hash, number)? else { continue };
        for tx in &body.transactions {
            batch.put(hash_key(TX_LOOKUP_PREFIX, tx.hash()), number.to_be_bytes().to_vec());
        }
        if batch.value_size() >= IDEAL_BATCH_SIZE {
            db.write(std::mem::take(&mut batch))?;
        }
    }
    write_tx_index_tail(&mut batch, from);
    db.write(batch)?;
    debug!(from, to, "Indexed transactions");
    Ok(())
}

/// Removes the tx index of all canonical blocks in `from..to` and advances
/// the index tail to `to`.
pub fn unindex_transactions(
    db: &ChainDb,
    from: BlockNumber,
    to: BlockNumber,
    interrupt: &AtomicBool,
) -> Result<(), StoreError> {
    let mut batch = WriteBatch::new();
    for number in from..to {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        let Some(hash) = read_canonical_hash(db, number)? else { continue };
        let Some(body) = read_body(db, hash, number)? else { continue };
        for tx in &body.transactions {
            batch.delete(hash_key(TX_LOOKUP_PREFIX, tx.hash()));
        }
        if batch.value_size() >= IDEAL_BATCH_SIZE {
            db.write(std::mem::take(&mut batch))?;
        }
    }
    write_tx_index_tail(&mut batch, to);
    db.write(batch)?;
    debug!(from, to, "Unindexed transactions");
    Ok(())
}

// ---------- markers ----------

fn write_marker(batch: &mut WriteBatch, key: &[u8], hash: BlockHash) {
    batch.put(key.to_vec(), hash.as_slice().to_vec());
}

fn read_hash_marker(store: &dyn KeyValueStore, key: &[u8]) -> Result<Option<BlockHash>, StoreError> {
    Ok(store.get(key)?.filter(|value| value.len() == 32).map(|value| BlockHash::from_slice(&value)))
}

fn read_num_marker(store: &dyn KeyValueStore, key: &[u8]) -> Result<Option<u64>, StoreError> {
    Ok(store
        .get(key)?
        .and_then(|value| <[u8; 8]>::try_from(value.as_slice()).ok())
        .map(u64::from_be_bytes))
}

/// Queues the head-block marker.
pub fn write_head_block_hash(batch: &mut WriteBatch, hash: BlockHash) {
    write_marker(batch, HEAD_BLOCK_KEY, hash);
}

/// Reads the head-block marker.
pub fn read_head_block_hash(db: &ChainDb) -> Result<Option<BlockHash>, StoreError> {
    read_hash_marker(&**db.live(), HEAD_BLOCK_KEY)
}

/// Queues the head-header marker.
pub fn write_head_header_hash(batch: &mut WriteBatch, hash: BlockHash) {
    write_marker(batch, HEAD_HEADER_KEY, hash);
}

/// Reads the head-header marker.
pub fn read_head_header_hash(db: &ChainDb) -> Result<Option<BlockHash>, StoreError> {
    read_hash_marker(&**db.live(), HEAD_HEADER_KEY)
}

/// Queues the head-fast-block marker.
pub fn write_head_fast_block_hash(batch: &mut WriteBatch, hash: BlockHash) {
    write_marker(batch, HEAD_FAST_BLOCK_KEY, hash);
}

/// Reads the head-fast-block marker.
pub fn read_head_fast_block_hash(db: &ChainDb) -> Result<Option<BlockHash>, StoreError> {
    read_hash_marker(&**db.live(), HEAD_FAST_BLOCK_KEY)
}

/// Queues the snapshot disk-layer root marker.
pub fn write_snapshot_root(batch: &mut WriteBatch, root: B256) {
    batch.put(SNAPSHOT_ROOT_KEY.to_vec(), root.as_slice().to_vec());
}

/// Reads the snapshot disk-layer root marker.
pub fn read_snapshot_root(db: &ChainDb) -> Result<Option<B256>, StoreError> {
    read_hash_marker(&**db.live(), SNAPSHOT_ROOT_KEY)
}

/// Writes the snapshot recovery number directly.
pub fn write_snapshot_recovery_number(db: &ChainDb, number: BlockNumber) -> Result<(), StoreError> {
    db.live().put(SNAPSHOT_RECOVERY_KEY.to_vec(), number.to_be_bytes().to_vec())
}

/// Reads the snapshot recovery number.
pub fn read_snapshot_recovery_number(db: &ChainDb) -> Result<Option<BlockNumber>, StoreError> {
    read_num_marker(&**db.live(), SNAPSHOT_RECOVERY_KEY)
}

/// Writes the safe-point block number directly.
pub fn write_safe_point_number(db: &ChainDb, number: BlockNumber) -> Result<(), StoreError> {
    db.live().put(SAFE_POINT_KEY.to_vec(), number.to_be_bytes().to_vec())
}

/// Reads the safe-point block number.
pub fn read_safe_point_number(db: &ChainDb) -> Result<Option<BlockNumber>, StoreError> {
    read_num_marker(&**db.live(), SAFE_POINT_KEY)
}

/// Writes the last fast-sync pivot number directly.
pub fn write_last_pivot_number(db: &ChainDb, number: BlockNumber) -> Result<(), StoreError> {
    db.live().put(LAST_PIVOT_KEY.to_vec(), number.to_be_bytes().to_vec())
}

/// Reads the last fast-sync pivot number.
pub fn read_last_pivot_number(db: &ChainDb) -> Result<Option<BlockNumber>, StoreError> {
    read_num_marker(&**db.live(), LAST_PIVOT_KEY)
}

/// Queues the tx-index tail cursor.
pub fn write_tx_index_tail(batch: &mut WriteBatch, number: BlockNumber) {
    batch.put(TX_INDEX_TAIL_KEY.to_vec(), number.to_be_bytes().to_vec());
}

/// Reads the tx-index tail cursor.
pub fn read_tx_index_tail(db: &ChainDb) -> Result<Option<BlockNumber>, StoreError> {
    read_num_marker(&**db.live(), TX_INDEX_TAIL_KEY)
}

// ---------- bad blocks ----------

/// Persists an offending block for later forensics.
pub fn write_bad_block(db: &ChainDb, block: &SealedBlock) -> Result<(), StoreError> {
    db.live()
        .put(hash_key(BAD_BLOCK_PREFIX, block.hash()), alloy_rlp::encode(&block.clone().unseal()))
}

/// Reads a previously reported bad block.
pub fn read_bad_block(db: &ChainDb, hash: BlockHash) -> Result<Option<SealedBlock>, StoreError> {
    let Some(value) = db.live().get(&hash_key(BAD_BLOCK_PREFIX, hash))? else {
        return Ok(None);
    };
    decode::<trellis_primitives::Block>("bad block", value).map(|block| Some(block.seal_slow()))
}

// ---------- diff layers ----------

/// Queues a diff-layer write (diff store batch).
pub fn write_diff_layer(batch: &mut WriteBatch, hash: BlockHash, diff: &DiffLayer) {
    batch.put(hash_key(DIFF_LAYER_PREFIX, hash), diff.encode().to_vec());
}

/// Deletes a diff layer (diff store batch).
pub fn delete_diff_layer(batch: &mut WriteBatch, hash: BlockHash) {
    batch.delete(hash_key(DIFF_LAYER_PREFIX, hash));
}

/// Reads a raw encoded diff layer from the diff store.
pub fn read_diff_layer_encoded(
    store: &dyn KeyValueStore,
    hash: BlockHash,
) -> Result<Option<Vec<u8>>, StoreError> {
    store.get(&hash_key(DIFF_LAYER_PREFIX, hash))
}

/// Reads and decodes a diff layer from the diff store.
pub fn read_diff_layer(
    store: &dyn KeyValueStore,
    hash: BlockHash,
) -> Result<Option<DiffLayer>, StoreError> {
    let Some(value) = store.get(&hash_key(DIFF_LAYER_PREFIX, hash))? else {
        return Ok(None);
    };
    DiffLayer::decode(&value)
        .map(Some)
        .map_err(|err| StoreError::Corrupt { context: "diff layer", reason: err.to_string() })
}

// ---------- preimages ----------

/// Queues trie-key preimage writes.
pub fn write_preimages(batch: &mut WriteBatch, preimages: &[(B256, trellis_primitives::Bytes)]) {
    for (hash, preimage) in preimages {
        batch.put(hash_key(PREIMAGE_PREFIX, *hash), preimage.to_vec());
    }
}

/// Reads a trie-key preimage.
pub fn read_preimage(
    db: &ChainDb,
    hash: B256,
) -> Result<Option<trellis_primitives::Bytes>, StoreError> {
    Ok(db.live().get(&hash_key(PREIMAGE_PREFIX, hash))?.map(Into::into))
}

// ---------- state blobs ----------

/// Queues a committed state blob write.
pub fn write_state_blob(batch: &mut WriteBatch, root: B256, blob: &[u8]) {
    batch.put(hash_key(STATE_PREFIX, root), blob.to_vec());
}

/// Reads a committed state blob.
pub fn read_state_blob(
    db: &ChainDb,
    root: B256,
) -> Result<Option<trellis_primitives::Bytes>, StoreError> {
    Ok(db.live().get(&hash_key(STATE_PREFIX, root))?.map(Into::into))
}

// ---------- versioning ----------

/// Checks the stored database version, writing it on first use.
pub fn ensure_database_version(db: &ChainDb) -> Result<(), StoreError> {
    match read_num_marker(&**db.live(), DB_VERSION_KEY)? {
        Some(found) if found != CHAIN_DB_VERSION => {
            Err(StoreError::IncompatibleVersion { found, expected: CHAIN_DB_VERSION })
        }
        Some(_) => Ok(()),
        None => db.live().put(DB_VERSION_KEY.to_vec(), CHAIN_DB_VERSION.to_be_bytes().to_vec()),
    }
}

/// Populates the live hash-to-number index and head-header marker from a
/// pre-existing ancient segment, so a fresh node can be plugged on top of
/// frozen history.
pub fn init_from_ancient(db: &ChainDb) -> Result<(), StoreError> {
    let Some(ancient) = db.ancient() else { return Ok(()) };
    let frozen = ancient.count();
    if frozen == 0 {
        return Ok(());
    }
    let mut batch = WriteBatch::new();
    let mut last_hash = None;
    for number in 0..frozen {
        if let Some(hash) = ancient.hash(number) {
            batch.put(hash_key(HEADER_NUMBER_PREFIX, hash), number.to_be_bytes().to_vec());
            last_hash = Some(hash);
        }
        if batch.value_size() >= IDEAL_BATCH_SIZE {
            db.write(std::mem::take(&mut batch))?;
        }
    }
    if let Some(hash) = last_hash {
        write_head_header_hash(&mut batch, hash);
    }
    db.write(batch)?;
    debug!(frozen, "Initialized database from ancient segment");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use assert_matches::assert_matches;
    use trellis_primitives::{Block, Transaction};

    fn db() -> ChainDb {
        ChainDb::new(MemoryStore::new())
    }

    fn block(number: BlockNumber, txs: usize) -> SealedBlock {
        let transactions = (0..txs)
            .map(|i| Transaction { nonce: number * 100 + i as u64, ..Default::default() })
            .collect();
        let body = Body { transactions, uncles: vec![] };
        let header = Header { number, tx_root: body.compute_tx_root(), ..Default::default() };
        Block { header, body }.seal_slow()
    }

    #[test]
    fn header_roundtrip_with_number_index() {
        let db = db();
        let block = block(7, 0);
        let mut batch = WriteBatch::new();
        write_header(&mut batch, &block.header);
        db.write(batch).unwrap();

        assert_eq!(
            read_header(&db, block.hash(), 7).unwrap().unwrap(),
            block.header.header().clone()
        );
        assert_eq!(read_header_number(&db, block.hash()).unwrap(), Some(7));
    }

    #[test]
    fn receipts_derive_block_metadata() {
        let db = db();
        let block = block(3, 2);
        let receipts = vec![Receipt::default(), Receipt::default()];
        let mut batch = WriteBatch::new();
        write_block(&mut batch, &block);
        write_receipts(&mut batch, 3, block.hash(), &receipts);
        db.write(batch).unwrap();

        let read = read_receipts(&db, block.hash(), 3).unwrap().unwrap();
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn canonical_mapping_roundtrip() {
        let db = db();
        let mut batch = WriteBatch::new();
        write_canonical_hash(&mut batch, 5, BlockHash::repeat_byte(5));
        db.write(batch).unwrap();
        assert_eq!(read_canonical_hash(&db, 5).unwrap(), Some(BlockHash::repeat_byte(5)));

        let mut batch = WriteBatch::new();
        delete_canonical_hash(&mut batch, 5);
        db.write(batch).unwrap();
        assert_eq!(read_canonical_hash(&db, 5).unwrap(), None);
    }

    #[test]
    fn tx_index_window_moves() {
        let db = db();
        let interrupt = AtomicBool::new(false);
        let mut batch = WriteBatch::new();
        for number in 0..4u64 {
            let block = block(number, 1);
            write_block(&mut batch, &block);
            write_canonical_hash(&mut batch, number, block.hash());
        }
        db.write(batch).unwrap();

        index_transactions(&db, 0, 4, &interrupt).unwrap();
        let tx0 = block(0, 1).body.transactions[0].hash();
        assert!(read_tx_lookup(&db, tx0).unwrap().is_some());

        unindex_transactions(&db, 0, 2, &interrupt).unwrap();
        assert!(read_tx_lookup(&db, tx0).unwrap().is_none());
        assert_eq!(read_tx_index_tail(&db).unwrap(), Some(2));
    }

    #[test]
    fn version_mismatch_is_detected() {
        let db = db();
        ensure_database_version(&db).unwrap();
        db.live().put(DB_VERSION_KEY.to_vec(), 3u64.to_be_bytes().to_vec()).unwrap();
        assert_matches!(
            ensure_database_version(&db),
            Err(StoreError::IncompatibleVersion { found: 3, .. })
        );
    }
}
