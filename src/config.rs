#[derive(Clone, Debug)]
pub struct LeaseConfig {
    page_size: usize,
    write_back_threads: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            write_back_threads: 2,
        }
    }
}
impl LeaseConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Number of sessions requested per page while reconciling with the store.
    pub fn get_page_size(&self) -> usize {
        self.page_size
    }
    /// Worker threads used to write expirations back to the store.
    pub fn get_write_back_threads(&self) -> usize {
        self.write_back_threads
    }
    /// A page size of zero is bumped to one.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
    pub fn write_back_threads(mut self, threads: usize) -> Self {
        self.write_back_threads = threads.max(1);
        self
    }
}
