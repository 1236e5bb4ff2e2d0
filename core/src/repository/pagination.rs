#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PaginationError {
    #[error("Page size must be at least 1")]
    ZeroPageSize,
}

/// One page of results together with the paging state needed to navigate.
#[derive(Debug, Clone, PartialEq)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page_num: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

/// Row offset of the requested page.
///
/// `page_num` is clamped to the start of the last *full* page, so when the
/// total is not a multiple of `page_size` the trailing partial page cannot be
/// reached by asking for a page past the end.
pub fn page_offset(page_num: u64, page_size: u64, total: u64) -> u64 {
    page_num.min((total / page_size) * page_size)
}

impl<T> Paginated<T> {
    pub fn empty(page_size: u64) -> Self {
        Paginated { items: Vec::new(), page_num: 0, page_size, total_pages: 0 }
    }

    /// Builds a page from already-fetched items and the total row count.
    pub fn from_count(items: Vec<T>, count: u64, page_num: u64, page_size: u64) -> Self {
        let total_pages = count.div_ceil(page_size);
        Paginated { items, page_num: total_pages.min(page_num.max(1)), page_size, total_pages }
    }

    /// Paginates an in-memory list; pages are numbered from 1.
    pub fn from_items(source: Vec<T>, page_num: u64, page_size: u64) -> Result<Self, PaginationError> {
        if page_size == 0 {
            return Err(PaginationError::ZeroPageSize);
        }

        let count = source.len() as u64;
        let mut page = Paginated::from_count(Vec::new(), count, page_num, page_size);
        let skip = page.page_num.saturating_sub(1) * page_size;
        page.items = source.into_iter().skip(skip as usize).take(page_size as usize).collect();

        Ok(page)
    }

    pub fn previous_page(&self) -> u64 {
        self.page_num.saturating_sub(1).max(1)
    }

    pub fn has_previous_page(&self) -> bool {
        self.page_num > 1
    }

    pub fn next_page(&self) -> u64 {
        (self.page_num + 1).min(self.total_pages)
    }

    pub fn has_next_page(&self) -> bool {
        self.page_num < self.total_pages
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            page_num: self.page_num,
            page_size: self.page_size,
            total_pages: self.total_pages,
        }
    }
}
