//! End-to-end scenarios run against `Pool::open_anonymous`, exercising the
//! trie, paged vector, and blob store together rather than one module at a
//! time.

use std::time::Duration;

use grnxx_pool::{BlobOptions, DATrie, PagedVector, PoolOptions};

/// Small xorshift PRNG so scenario 3/4's random keys are reproducible
/// without pulling in a dependency the rest of the crate doesn't use.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Xorshift64(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn digit_string(&mut self, len: usize) -> String {
        (0..len).map(|_| (b'0' + (self.next_u64() % 10) as u8) as char).collect()
    }
}

#[test]
fn scenario_1_insert_search_remove_reinsert() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let trie = DATrie::create(pool).unwrap();

    let apple = trie.insert(b"apple").unwrap().unwrap();
    let banana = trie.insert(b"banana").unwrap().unwrap();
    let strawberry = trie.insert(b"strawberry").unwrap().unwrap();
    assert_eq!((apple, banana, strawberry), (0, 1, 2));

    assert_eq!(trie.insert(b"apple").unwrap(), Err(grnxx_pool::AlreadyPresent(0)));
    assert_eq!(trie.search(b"apple").unwrap(), Some(0));

    assert!(trie.remove(b"banana").unwrap());
    assert_eq!(trie.search(b"apple").unwrap(), Some(0));
    assert_eq!(trie.search(b"strawberry").unwrap(), Some(2));
    assert_eq!(trie.search(b"banana").unwrap(), None);

    let new_banana = trie.insert(b"banana").unwrap().unwrap();
    assert_eq!(new_banana, 1);
}

#[test]
fn scenario_2_lcp_search_finds_longest_matching_prefix() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let trie = DATrie::create(pool).unwrap();

    let ab = trie.insert(b"AB").unwrap().unwrap();
    let abcd = trie.insert(b"ABCD").unwrap().unwrap();
    let abe = trie.insert(b"ABE").unwrap().unwrap();

    assert_eq!(trie.lcp_search(b"").unwrap(), None);
    assert_eq!(trie.lcp_search(b"A").unwrap(), None);
    assert_eq!(trie.lcp_search(b"AB").unwrap(), Some((ab, b"AB".to_vec())));
    assert_eq!(trie.lcp_search(b"ABC").unwrap(), Some((ab, b"AB".to_vec())));
    assert_eq!(trie.lcp_search(b"ABCD").unwrap(), Some((abcd, b"ABCD".to_vec())));
    assert_eq!(trie.lcp_search(b"ABCDE").unwrap(), Some((abcd, b"ABCD".to_vec())));
    assert_eq!(trie.lcp_search(b"ABE").unwrap(), Some((abe, b"ABE".to_vec())));
    assert_eq!(trie.lcp_search(b"BCD").unwrap(), None);
}

#[test]
fn scenario_3_four_thousand_ninety_six_random_keys_split_true_false() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let trie = DATrie::create(pool).unwrap();
    let mut rng = Xorshift64::new(0x5EED_5EED_5EED_5EED);

    let mut seen = std::collections::HashSet::new();
    let mut true_set = Vec::new();
    let mut false_set = Vec::new();
    while true_set.len() + false_set.len() < 4096 {
        let len = 1 + (rng.next_u64() % 10) as usize;
        let key = rng.digit_string(len);
        if !seen.insert(key.clone()) {
            continue;
        }
        if true_set.len() < 2048 {
            true_set.push(key);
        } else {
            false_set.push(key);
        }
    }

    let mut ids = std::collections::HashMap::new();
    for key in &true_set {
        let id = trie.insert(key.as_bytes()).unwrap().unwrap();
        ids.insert(key.clone(), id);
    }
    for key in &true_set {
        assert_eq!(trie.search(key.as_bytes()).unwrap(), Some(ids[key]));
    }
    for key in &false_set {
        assert_eq!(trie.search(key.as_bytes()).unwrap(), None);
    }
}

// spec.md §8 scenario 4 removes `F` "by ID"; `DATrie::remove` only takes a
// key (there is no remove-by-id entry point in its public contract, spec.md
// §3.3), so this removes by the key each id maps to instead — the same
// entries come out either way.
#[test]
fn scenario_4_remove_by_id_then_reinsert_restores_searchability() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let trie = DATrie::create(pool).unwrap();
    let mut rng = Xorshift64::new(0xC0FFEE_C0FFEE);

    let mut seen = std::collections::HashSet::new();
    let mut true_set = Vec::new();
    let mut false_set = Vec::new();
    while true_set.len() + false_set.len() < 512 {
        let len = 1 + (rng.next_u64() % 10) as usize;
        let key = rng.digit_string(len);
        if !seen.insert(key.clone()) {
            continue;
        }
        if true_set.len() < 256 {
            true_set.push(key);
        } else {
            false_set.push(key);
        }
    }

    for key in true_set.iter().chain(false_set.iter()) {
        trie.insert(key.as_bytes()).unwrap().unwrap();
    }

    for key in &false_set {
        assert!(trie.remove(key.as_bytes()).unwrap());
    }
    for key in &true_set {
        assert!(trie.search(key.as_bytes()).unwrap().is_some());
    }
    for key in &false_set {
        assert_eq!(trie.search(key.as_bytes()).unwrap(), None);
    }

    for key in &false_set {
        trie.insert(key.as_bytes()).unwrap().unwrap();
    }
    for key in true_set.iter().chain(false_set.iter()) {
        assert!(trie.search(key.as_bytes()).unwrap().is_some());
    }
}

// spec.md §8 scenario 5 says "unlink and re-open from the same header
// block"; `PagedVector::unlink` (singular) forgets one element's page, not
// the whole vector, so "unlink" here means dropping this process's handle
// and reopening by header block id, which is what actually needs to survive
// for a persistent vector.
#[test]
fn scenario_5_paged_vector_survives_drop_and_reopen() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let vector: PagedVector<u32> = PagedVector::create(pool.clone(), 0).unwrap();

    assert_eq!(vector.get(1_000_000).unwrap(), 0);
    *vector.get_mut(1_000_000).unwrap() = 42;
    assert_eq!(vector.get(1_000_000).unwrap(), 42);

    let header_id = vector.header_block_id();
    drop(vector);
    let reopened: PagedVector<u32> = PagedVector::open(pool, header_id).unwrap();
    assert_eq!(reopened.get(1_000_000).unwrap(), 42);
}

// spec.md §8 scenario 6 names a 1024-byte payload as "MEDIUM"; this
// implementation's MEDIUM classes top out at 64 bytes (spec.md §3.4's own
// 8/16/32/64 table), so a 1024-byte value falls in the LARGE store instead.
// The property under test — freed slots stay unavailable until
// `frozen_duration` elapses, then get reused by a subsequent allocation —
// is the same one either way; exercised here against LARGE, the class this
// payload size actually lands in.
#[test]
fn scenario_6_large_blob_storage_is_reused_once_thawed() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let mut opts = BlobOptions::default();
    opts.frozen_duration(Duration::from_millis(0));
    let store = opts.create(pool).unwrap();

    let payload = vec![0xABu8; 1024];
    let mut ids = Vec::with_capacity(1000);
    for _ in 0..1000 {
        ids.push(store.add(&payload).unwrap());
    }
    for &id in &ids {
        assert_eq!(store.get(id).unwrap(), payload);
    }
    for &id in &ids {
        store.unset(id).unwrap();
    }
    for &id in &ids {
        assert_eq!(store.get(id).unwrap(), Vec::<u8>::new());
    }

    std::thread::sleep(Duration::from_millis(2));
    let reused = store.add(&payload).unwrap();
    assert_eq!(store.get(reused).unwrap(), payload);
}

// Regresses a free-list sizing bug where freeing a small LARGE value and
// then allocating a bigger one could hand back a too-small slot, corrupting
// whatever followed it in the backing store. `small` needs a 160-byte
// capacity (5 units) and sits right before `neighbor`; once `small` is freed
// and thawed, a request needing a 256-byte capacity (8 units) must not reuse
// `small`'s slot and write past it into `neighbor`.
#[test]
fn scenario_6b_freeing_a_small_large_value_does_not_corrupt_a_later_bigger_one() {
    let pool = PoolOptions::default().open_anonymous().unwrap();
    let mut opts = BlobOptions::default();
    opts.frozen_duration(Duration::from_millis(0));
    let store = opts.create(pool).unwrap();

    let small = vec![0x11u8; 136];
    let neighbor = vec![0x22u8; 40];
    let small_id = store.add(&small).unwrap();
    let neighbor_id = store.add(&neighbor).unwrap();

    store.unset(small_id).unwrap();
    std::thread::sleep(Duration::from_millis(2));

    let big = vec![0x33u8; 232];
    let big_id = store.add(&big).unwrap();

    assert_eq!(store.get(big_id).unwrap(), big);
    assert_eq!(store.get(neighbor_id).unwrap(), neighbor);
}
