/// Tuning knobs the storage engine accepts from its caller.
///
/// Loading these from a file or environment is the hosting application's job;
/// this type only carries the values once they're known.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of resident pages the cache holds at once. Must be at least 2
    /// so the two root-header copies can both stay resident during commit.
    pub cache_capacity: usize,
    /// File growth happens in units of this many pages, to amortize the cost
    /// of extending and re-mapping the backing file.
    pub extension_quantum_pages: usize,
    /// Whether `commit` fsyncs the journal before applying writes. Disabling
    /// this trades durability for throughput; only meant for throwaway or
    /// in-memory-backed databases.
    pub sync_journal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            extension_quantum_pages: 4,
            sync_journal: true,
        }
    }
}
