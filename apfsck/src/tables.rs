/// Id-keyed side tables used by the reconciliation engine. Entries hash into
/// a fixed number of buckets by `id % 512`; within a bucket they are kept
/// sorted ascending by id, so every id occupies exactly one slot.

pub const TABLE_BUCKETS: usize = 512;

struct Slot<T> {
    id: u64,
    data: T,
}

pub struct IdTable<T> {
    buckets: Vec<Vec<Slot<T>>>,
    len: usize,
}

impl<T: Default> IdTable<T> {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(TABLE_BUCKETS);
        buckets.resize_with(TABLE_BUCKETS, Vec::new);
        IdTable { buckets, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket(id: u64) -> usize {
        (id % TABLE_BUCKETS as u64) as usize
    }

    /// Find the entry for `id`, splicing a default-initialised one into its
    /// sorted position on a miss.
    pub fn get_or_create(&mut self, id: u64) -> &mut T {
        let chain = &mut self.buckets[Self::bucket(id)];
        match chain.binary_search_by_key(&id, |slot| slot.id) {
            Ok(pos) => &mut chain[pos].data,
            Err(pos) => {
                chain.insert(
                    pos,
                    Slot {
                        id,
                        data: T::default(),
                    },
                );
                self.len += 1;
                &mut chain[pos].data
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        let chain = &self.buckets[Self::bucket(id)];
        chain
            .binary_search_by_key(&id, |slot| slot.id)
            .ok()
            .map(|pos| &chain[pos].data)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        let chain = &mut self.buckets[Self::bucket(id)];
        match chain.binary_search_by_key(&id, |slot| slot.id) {
            Ok(pos) => Some(&mut chain[pos].data),
            Err(_) => None,
        }
    }

    /// Visit every entry, bucket by bucket, ascending by id within each
    /// bucket.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|slot| (slot.id, &slot.data)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> {
        self.buckets
            .iter_mut()
            .flat_map(|chain| chain.iter_mut().map(|slot| (slot.id, &mut slot.data)))
    }
}

impl<T: Default> Default for IdTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create() {
        let mut table: IdTable<u32> = IdTable::new();
        *table.get_or_create(7) = 70;
        *table.get_or_create(519) = 80; // same bucket as 7
        *table.get_or_create(3) = 30;

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(7), Some(&70));
        assert_eq!(table.get(519), Some(&80));
        assert_eq!(table.get(4), None);

        // Existing entries are returned, not replaced.
        *table.get_or_create(7) += 1;
        assert_eq!(table.get(7), Some(&71));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_chain_order() {
        let mut table: IdTable<u8> = IdTable::new();
        // All land in bucket 0 and must come back sorted.
        for id in [2048u64, 0, 1024, 3072, 512] {
            table.get_or_create(id);
        }
        let ids: Vec<u64> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 512, 1024, 2048, 3072]);
    }
}
