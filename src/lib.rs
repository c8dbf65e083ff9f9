// Tagged Cuckoo Associative Map
// An exact key/value store layered on a cuckoo filter: a bit-packed
// fingerprint table paired slot-for-slot with a key/value side map. Misses
// resolve at filter speed while hits return authoritative values, and keys
// can be deleted without the false-negative hazard of shared fingerprints.

use derive_builder::Builder;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Number of tag slots in each bucket.
const SLOTS_PER_BUCKET: usize = 4;

/// Prefix fed to the hasher before the key when deriving a tag hash.
/// Keeps the tag family independent of the index family even though both
/// run through the same `Hasher` type.
const TAG_FAMILY_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Error type for map insert operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Returned when the victim cache is already occupied and no further
    /// items can be accommodated
    #[error("Not enough space to store this item.")]
    NotEnoughSpace,
}

/// Outcome of placing a key's tags into a bucket.
///
/// The table reports which slot it touched so the caller can keep the side
/// map in step: on a kick the slot's tag is already overwritten, but the
/// previous resident's side-map entry is untouched until the caller reads
/// and replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// An empty slot was found and the tag written there
    Placed(usize),
    /// No slot was empty; the requested slot was overwritten and its
    /// previous resident must be relocated
    Kicked(usize),
    /// No slot was empty and no kick was requested
    Full,
}

/// Bit-packed fingerprint storage: one `u64` word per bucket, four tags per
/// word, with tag `s` in bits `[s * bits_per_tag, (s + 1) * bits_per_tag)`.
///
/// A tag of 0 marks an empty slot. Only fingerprint bits live here; full
/// keys are kept in the side map at the matching `(bucket, slot)` coordinate.
#[derive(Debug, Clone, Default)]
struct TagTable {
    bits_per_tag: usize,
    tag_mask: u64,
    words: Box<[u64]>,
}

impl TagTable {
    fn new(num_buckets: usize, bits_per_tag: usize) -> Self {
        Self {
            bits_per_tag,
            tag_mask: (1u64 << bits_per_tag) - 1,
            words: vec![0u64; num_buckets].into_boxed_slice(),
        }
    }

    fn size_in_bytes(&self) -> usize {
        self.words.len() * size_of::<u64>()
    }

    fn size_in_tags(&self) -> usize {
        self.words.len() * SLOTS_PER_BUCKET
    }

    fn read_tag(&self, bucket: usize, slot: usize) -> u16 {
        ((self.words[bucket] >> (slot * self.bits_per_tag)) & self.tag_mask) as u16
    }

    fn write_tag(&mut self, bucket: usize, slot: usize, tag: u16) {
        let shift = slot * self.bits_per_tag;
        let word = &mut self.words[bucket];
        *word = (*word & !(self.tag_mask << shift)) | ((tag as u64) << shift);
    }

    /// Place a key's per-slot tags into `bucket`.
    ///
    /// Scans the slots in order and writes `tags[slot]` into the first empty
    /// one. When the bucket is full and `kick_slot` is given, the tag at
    /// that slot is overwritten and `Kicked` returned; the caller must read
    /// the evicted entry from the side map before replacing it.
    fn place(
        &mut self,
        bucket: usize,
        tags: [u16; SLOTS_PER_BUCKET],
        kick_slot: Option<usize>,
    ) -> Placement {
        for slot in 0..SLOTS_PER_BUCKET {
            if self.read_tag(bucket, slot) == 0 {
                self.write_tag(bucket, slot, tags[slot]);
                return Placement::Placed(slot);
            }
        }
        match kick_slot {
            Some(slot) => {
                self.write_tag(bucket, slot, tags[slot]);
                Placement::Kicked(slot)
            }
            None => Placement::Full,
        }
    }
}

/// Key/value storage addressed by `(bucket, slot)`, mirroring the tag
/// table's occupancy: whenever a tag is non-zero, the entry at the same
/// coordinate holds the full key and its value.
#[derive(Debug, Clone)]
struct SideMap<K, V> {
    entries: Box<[Option<(K, V)>]>,
}

impl<K, V> SideMap<K, V> {
    fn new(num_buckets: usize) -> Self {
        let mut entries = Vec::new();
        entries.resize_with(num_buckets * SLOTS_PER_BUCKET, || None);
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    fn get(&self, bucket: usize, slot: usize) -> Option<&(K, V)> {
        self.entries[bucket * SLOTS_PER_BUCKET + slot].as_ref()
    }

    fn set(&mut self, bucket: usize, slot: usize, key: K, value: V) {
        self.entries[bucket * SLOTS_PER_BUCKET + slot] = Some((key, value));
    }

    fn clear(&mut self, bucket: usize, slot: usize) {
        self.entries[bucket * SLOTS_PER_BUCKET + slot] = None;
    }
}

impl<K, V> Default for SideMap<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new().into_boxed_slice(),
        }
    }
}

/// The single record kept out of the table when an insert exhausts its
/// relocation budget. A key parked here is still logically present: every
/// lookup and removal checks the victim before scanning buckets.
#[derive(Debug, Clone)]
struct Victim<K, V> {
    index: usize,
    tag_hash: u64,
    key: K,
    value: V,
}

/// An exact key/value map built from two coupled structures: a cuckoo-hashed
/// table of small fingerprints and a side map holding the full keys and
/// values, one entry per occupied fingerprint slot.
///
/// ## Why Two Structures
///
/// A cuckoo filter answers negative lookups from a few bits per key, but a
/// bare filter cannot return values, and deleting through one risks false
/// negatives when two keys share a fingerprint. Pairing every fingerprint
/// slot with a `(key, value)` entry keeps the filter's compact fast path
/// for misses while making positive lookups authoritative: a fingerprint
/// match only counts once it is confirmed against the stored key.
///
/// ## Algorithm Overview
///
/// 1. **Two bucket addresses**: a key's 64-bit hash is split into two
///    32-bit halves, each reduced modulo the bucket count. The two indices
///    are independent; neither is derived from the other.
///
/// 2. **Per-slot fingerprints**: a second hash of the key yields four tags,
///    one per slot of a bucket. The tag a key stores depends on which slot
///    it lands in, which is what makes false-positive remediation work.
///
/// 3. **Cuckoo relocation**: when both buckets are full, a random resident
///    is kicked to its alternate bucket, chaining up to `max_kicks` times.
///    A chain that never finds room parks its final record in a single-slot
///    victim cache instead of failing.
///
/// 4. **False-positive remediation**: when a lookup finds a fingerprint
///    match whose stored key differs from the query, the offending resident
///    is shuffled to a sibling slot in the same bucket. Its fingerprint
///    changes with the slot, so the same query stops aliasing at that
///    coordinate.
///
/// ## Concurrency
///
/// The map is a single-owner structure. Lookups run remediation, so
/// `get`, `contains` and `remove` all take `&mut self`; only `may_contain`
/// is a pure read. Shared access therefore needs an exclusive lock around
/// every operation, which the borrow checker already enforces for
/// in-process use.
#[derive(Debug, Builder)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "base_build", validate = "Self::validate")
)]
pub struct CuckooMap<K, V, H = DefaultHasher>
where
    K: Hash + Eq + Clone,
    V: Clone,
    H: Hasher + Default,
{
    // Configuration parameters
    /// Number of key slots to size the table for; rounded up so the bucket
    /// count is a power of two
    #[builder(default = "131072")]
    capacity: usize,

    /// Width of a stored fingerprint in bits (1 to 16; four tags must fit
    /// in one 64-bit tag hash)
    #[builder(default = "12")]
    bits_per_tag: usize,

    /// Maximum number of relocations before an insert parks its record in
    /// the victim cache
    #[builder(default = "500")]
    max_kicks: usize,

    /// Seed for the relocation and remediation RNG; drawn from the OS when
    /// absent. Fixing it makes eviction chains reproducible.
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,

    // Internal values - automatically derived from the configuration
    /// Number of buckets (power of 2)
    #[builder(setter(skip))]
    num_buckets: usize,

    /// Bit mask for extracting tags from a tag hash
    #[builder(setter(skip))]
    tag_mask: u64,

    /// Fingerprint storage
    #[builder(setter(skip))]
    table: TagTable,

    /// Full keys and values, one entry per occupied tag slot
    #[builder(setter(skip))]
    slots: SideMap<K, V>,

    /// Number of items currently stored, the parked victim included
    #[builder(setter(skip))]
    num_items: usize,

    /// Single-slot overflow cache
    #[builder(setter(skip))]
    victim: Option<Victim<K, V>>,

    /// Injected RNG driving kick-slot and remediation-slot choices
    #[builder(setter(skip), default = "SmallRng::seed_from_u64(0)")]
    rng: SmallRng,

    /// Phantom data for the hasher type
    #[builder(setter(skip))]
    _hasher: PhantomData<H>,
}

impl<K, V, H> CuckooMap<K, V, H>
where
    K: Hash + Eq + Clone,
    V: Clone,
    H: Hasher + Default,
{
    /// Insert a key/value pair.
    ///
    /// Returns `Err(NotEnoughSpace)` only when the victim cache was already
    /// occupied on entry; the map is then effectively full until a removal
    /// frees it. An insert whose relocation chain overflows *into* the
    /// victim cache still returns `Ok`: the key is stored and findable, and
    /// it is the next insert that fails.
    ///
    /// Duplicate keys are not coalesced; inserting a key twice stores two
    /// entries, and a removal deletes every copy it can reach.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        if self.victim.is_some() {
            return Err(Error::NotEnoughSpace);
        }
        let (i1, _i2, tags, tag_hash) = self.derive(&key);
        self.insert_impl(key, value, i1, tags, tag_hash);
        Ok(())
    }

    /// Look up a key and return a copy of its value.
    ///
    /// Every fingerprint match in both candidate buckets is confirmed
    /// against the side map, so a hit is authoritative and a miss is exact.
    /// Confirmed mismatches are remediated before returning, which is why
    /// lookups take `&mut self`.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let (i1, i2, tags, _) = self.derive(key);

        if let Some(victim) = &self.victim
            && victim.key == *key
            && (victim.index == i1 || victim.index == i2)
        {
            return Some(victim.value.clone());
        }

        let mut found = None;
        let mut false_positives = Vec::new();

        // The scan never short-circuits: every aliasing coordinate found in
        // this query gets remediated, hit or not.
        for index in [i1, i2] {
            for slot in 0..SLOTS_PER_BUCKET {
                if self.table.read_tag(index, slot) != tags[slot] {
                    continue;
                }
                match self.slots.get(index, slot) {
                    Some((stored, value)) if stored == key => found = Some(value.clone()),
                    Some(_) => false_positives.push((index, slot)),
                    None => debug_assert!(
                        false,
                        "matching tag at ({index}, {slot}) held no side-map entry"
                    ),
                }
            }
        }

        for (index, slot) in false_positives {
            self.remediate(index, slot);
        }
        found
    }

    /// Check whether a key is present, confirming fingerprint matches
    /// against the stored keys
    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Filter-only membership probe: true on the first fingerprint match,
    /// with no key comparison and no side-map access.
    ///
    /// May return false positives, never false negatives. This is the one
    /// lookup that does not mutate the map, which `&self` guarantees.
    pub fn may_contain(&self, key: &K) -> bool {
        let (i1, i2, tags, _) = self.derive(key);

        if let Some(victim) = &self.victim
            && victim.key == *key
            && (victim.index == i1 || victim.index == i2)
        {
            return true;
        }

        for index in [i1, i2] {
            for slot in 0..SLOTS_PER_BUCKET {
                if self.table.read_tag(index, slot) == tags[slot] {
                    return true;
                }
            }
        }
        false
    }

    /// Remove a key.
    ///
    /// Returns `true` if the key was found, either in the table or in the
    /// victim cache. When a table removal frees space while the victim
    /// cache is occupied, the victim is taken out and re-placed through the
    /// normal relocation path.
    pub fn remove(&mut self, key: &K) -> bool {
        let (i1, i2, tags, _) = self.derive(key);

        if let Some(victim) = &self.victim
            && victim.key == *key
            && (victim.index == i1 || victim.index == i2)
        {
            self.victim = None;
            self.num_items -= 1;
            return true;
        }

        let mut found = false;
        let mut false_positives = Vec::new();

        for index in [i1, i2] {
            for slot in 0..SLOTS_PER_BUCKET {
                if self.table.read_tag(index, slot) != tags[slot] {
                    continue;
                }
                let is_hit = match self.slots.get(index, slot) {
                    Some((stored, _)) => stored == key,
                    None => {
                        debug_assert!(
                            false,
                            "matching tag at ({index}, {slot}) held no side-map entry"
                        );
                        continue;
                    }
                };
                if is_hit {
                    self.table.write_tag(index, slot, 0);
                    self.slots.clear(index, slot);
                    self.num_items -= 1;
                    found = true;
                } else {
                    false_positives.push((index, slot));
                }
            }
        }

        for (index, slot) in false_positives {
            self.remediate(index, slot);
        }

        if !found {
            return false;
        }

        // A removal made room, so the parked victim gets another run at the
        // table, starting from the index it was displaced toward.
        if let Some(victim) = self.victim.take() {
            let tags = self.tags_from_hash(victim.tag_hash);
            self.num_items -= 1;
            self.insert_impl(victim.key, victim.value, victim.index, tags, victim.tag_hash);
        }
        true
    }

    /// Number of items currently stored, the parked victim included
    pub fn len(&self) -> usize {
        self.num_items
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.num_items == 0
    }

    /// Total slot capacity of the table (buckets times slots per bucket)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the fingerprint table in bytes. The side map's key/value
    /// storage is not included.
    pub fn size_in_bytes(&self) -> usize {
        self.table.size_in_bytes()
    }

    /// Human-readable summary of geometry and occupancy
    pub fn info(&self) -> String {
        let mut info = format!(
            "CuckooMap status:\n\
             \t\tbuckets: {} x {} slots x {} bit tags\n\
             \t\tkeys stored: {}\n\
             \t\tload factor: {:.4}\n\
             \t\ttable size: {} KiB\n",
            self.num_buckets,
            SLOTS_PER_BUCKET,
            self.bits_per_tag,
            self.len(),
            self.load_factor(),
            self.size_in_bytes() >> 10,
        );
        if self.num_items > 0 {
            info.push_str(&format!("\t\tbits/key: {:.2}\n", self.bits_per_key()));
        } else {
            info.push_str("\t\tbits/key: n/a\n");
        }
        info
    }

    /// Fraction of tag slots occupied
    fn load_factor(&self) -> f64 {
        self.num_items as f64 / self.table.size_in_tags() as f64
    }

    fn bits_per_key(&self) -> f64 {
        8.0 * self.table.size_in_bytes() as f64 / self.num_items as f64
    }

    /// Compute the hash of a key with the configured hasher type
    fn hash_key(&self, key: &K) -> u64 {
        let mut hasher = <H as Default>::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Compute a key's tag hash: the same hasher type, domain-separated
    /// from the index hash by a fixed prefix
    fn hash_tag(&self, key: &K) -> u64 {
        let mut hasher = <H as Default>::default();
        TAG_FAMILY_SEED.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Derive a key's two bucket indices, per-slot tags, and tag hash.
    ///
    /// The index hash is split into two 32-bit halves and each reduced with
    /// a bitwise AND, so the two indices are independent bucket addresses.
    /// The mapping is deterministic for any given hasher type.
    fn derive(&self, key: &K) -> (usize, usize, [u16; SLOTS_PER_BUCKET], u64) {
        let hash = self.hash_key(key);
        let i1 = hash as u32 as usize & (self.num_buckets - 1);
        let i2 = (hash >> 32) as usize & (self.num_buckets - 1);
        let tag_hash = self.hash_tag(key);
        (i1, i2, self.tags_from_hash(tag_hash), tag_hash)
    }

    /// Extract the four per-slot tags from a tag hash, low bits first.
    ///
    /// A tag of 0 would read as an empty slot, so any zero extraction is
    /// forced to 1. The tag stored for a key depends on which slot the key
    /// occupies: slot `s` stores `tags[s]`.
    fn tags_from_hash(&self, tag_hash: u64) -> [u16; SLOTS_PER_BUCKET] {
        let mut tags = [0u16; SLOTS_PER_BUCKET];
        let mut rest = tag_hash;
        for tag in &mut tags {
            *tag = (rest & self.tag_mask) as u16;
            if *tag == 0 {
                *tag = 1;
            }
            rest >>= self.bits_per_tag;
        }
        tags
    }

    /// Place a record, relocating residents along a cuckoo chain of at most
    /// `max_kicks` steps.
    ///
    /// Each kick overwrites the chosen slot's tag first and only then swaps
    /// the side-map entry, reading the displaced record in between; the
    /// side map trails the table by exactly one write, so the two views
    /// never disagree about which key a coordinate belongs to. A chain that
    /// exhausts its budget parks the in-flight record in the victim cache,
    /// where it stays visible to lookups and removals.
    fn insert_impl(
        &mut self,
        mut key: K,
        mut value: V,
        mut index: usize,
        mut tags: [u16; SLOTS_PER_BUCKET],
        mut tag_hash: u64,
    ) {
        for count in 0..self.max_kicks {
            let kick_slot = if count > 0 {
                Some(self.rng.random_range(0..SLOTS_PER_BUCKET))
            } else {
                None
            };
            match self.table.place(index, tags, kick_slot) {
                Placement::Placed(slot) => {
                    self.slots.set(index, slot, key, value);
                    self.num_items += 1;
                    return;
                }
                Placement::Kicked(slot) => {
                    let displaced = self.slots.get(index, slot).cloned();
                    self.slots.set(index, slot, key, value);
                    debug_assert!(
                        displaced.is_some(),
                        "kicked slot ({index}, {slot}) held no side-map entry"
                    );
                    let Some((displaced_key, displaced_value)) = displaced else {
                        self.num_items += 1;
                        return;
                    };
                    key = displaced_key;
                    value = displaced_value;
                }
                Placement::Full => {}
            }
            // Send the in-flight key to its alternate bucket.
            let (i1, i2, next_tags, next_tag_hash) = self.derive(&key);
            tags = next_tags;
            tag_hash = next_tag_hash;
            index = if index == i1 { i2 } else { i1 };
        }

        self.victim = Some(Victim {
            index,
            tag_hash,
            key,
            value,
        });
        self.num_items += 1;
    }

    /// Shuffle a discovered false-positive site.
    ///
    /// `(index, slot)` is a coordinate whose tag matched a query but whose
    /// stored key did not. The resident moves to a sibling slot chosen
    /// uniformly from the other three; because fingerprints are per-slot,
    /// the move changes the resident's stored tag to one taken from a
    /// different position in its tag hash, independent of the one that
    /// aliased. The vacated slot either becomes empty or inherits the
    /// sibling's resident with *its* tag re-derived for that slot, so the
    /// same query is unlikely to collide at this coordinate again.
    ///
    /// Both residents already have this bucket among their two candidate
    /// indices, so the shuffle never moves a key somewhere a lookup would
    /// not search.
    fn remediate(&mut self, index: usize, slot: usize) {
        // An earlier shuffle in the same scan may have emptied the site
        // (both candidate buckets can be the same bucket).
        if self.table.read_tag(index, slot) == 0 {
            return;
        }

        let new_slot = {
            let candidate = self.rng.random_range(0..SLOTS_PER_BUCKET - 1);
            if candidate == slot {
                SLOTS_PER_BUCKET - 1
            } else {
                candidate
            }
        };

        let Some((site_key, site_value)) = self.slots.get(index, slot).cloned() else {
            debug_assert!(
                false,
                "occupied tag at ({index}, {slot}) held no side-map entry"
            );
            return;
        };
        let site_tags = self.tags_from_hash(self.hash_tag(&site_key));

        if self.table.read_tag(index, new_slot) == 0 {
            self.table.write_tag(index, slot, 0);
            self.table.write_tag(index, new_slot, site_tags[new_slot]);
            self.slots.clear(index, slot);
            self.slots.set(index, new_slot, site_key, site_value);
        } else {
            let Some((sibling_key, sibling_value)) = self.slots.get(index, new_slot).cloned()
            else {
                debug_assert!(
                    false,
                    "occupied tag at ({index}, {new_slot}) held no side-map entry"
                );
                return;
            };
            let sibling_tags = self.tags_from_hash(self.hash_tag(&sibling_key));
            self.table.write_tag(index, slot, sibling_tags[slot]);
            self.table.write_tag(index, new_slot, site_tags[new_slot]);
            self.slots.set(index, slot, sibling_key, sibling_value);
            self.slots.set(index, new_slot, site_key, site_value);
        }
    }
}

impl<K, V> CuckooMap<K, V, DefaultHasher>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new CuckooMapBuilder with default settings
    pub fn builder() -> CuckooMapBuilder<K, V, DefaultHasher> {
        CuckooMapBuilder::default()
    }

    /// Create a new CuckooMap with default settings
    pub fn new() -> CuckooMap<K, V, DefaultHasher> {
        Self::builder().build().unwrap()
    }

    /// Create a new CuckooMap sized for the given number of keys
    pub fn with_capacity(capacity: usize) -> CuckooMap<K, V, DefaultHasher> {
        Self::builder().capacity(capacity).build().unwrap()
    }
}

impl<K, V> Default for CuckooMap<K, V, DefaultHasher>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new CuckooMap with default settings
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> CuckooMapBuilder<K, V, H>
where
    K: Hash + Eq + Clone,
    V: Clone,
    H: Hasher + Default,
{
    /// Validate the builder configuration
    fn validate(&self) -> Result<(), String> {
        if let Some(bits_per_tag) = self.bits_per_tag
            && !(1..=16).contains(&bits_per_tag)
        {
            return Err("bits_per_tag must be between 1 and 16".into());
        }
        if self.max_kicks == Some(0) {
            return Err("max_kicks must be greater than zero".into());
        }
        Ok(())
    }

    /// Build a CuckooMap with the specified configuration
    pub fn build(self) -> Result<CuckooMap<K, V, H>, CuckooMapBuilderError> {
        let mut map = self.base_build()?;
        // Least power of two holding the requested capacity at four slots
        // per bucket; a capacity of 0 or 1 still yields one bucket.
        map.num_buckets = map
            .capacity
            .div_ceil(SLOTS_PER_BUCKET)
            .max(1)
            .next_power_of_two();
        // Double the bucket count if the requested capacity would load the
        // table past 0.96.
        let load = map.capacity as f64 / (map.num_buckets * SLOTS_PER_BUCKET) as f64;
        if load > 0.96 {
            map.num_buckets <<= 1;
        }
        // Adjust the capacity to match the actual number of slots
        map.capacity = map.num_buckets * SLOTS_PER_BUCKET;
        map.tag_mask = (1u64 << map.bits_per_tag) - 1;
        map.table = TagTable::new(map.num_buckets, map.bits_per_tag);
        map.slots = SideMap::new(map.num_buckets);
        map.rng = match map.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(map)
    }
}
