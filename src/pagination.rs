//! Page math shared by every list screen

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "page", rename_all = "snake_case")]
pub enum PageLink {
    Page(u32),
    Ellipsis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    current_page: u32,
    items_per_page: u32,
    total_items: u64,
}

impl Pagination {
    /// `current_page` is 1-based and clamped into range; a zero page size counts as 1.
    pub fn new(current_page: u32, items_per_page: u32, total_items: u64) -> Self {
        let mut pagination = Self {
            current_page,
            items_per_page: items_per_page.max(1),
            total_items,
        };
        pagination.current_page = pagination.clamp(current_page);
        pagination
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn items_per_page(&self) -> u32 {
        self.items_per_page
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    /// ceil(total / per_page); 0 for an empty list
    pub fn total_pages(&self) -> u32 {
        let per_page = u64::from(self.items_per_page);
        ((self.total_items + per_page - 1) / per_page) as u32
    }

    /// Pulls `page` into `1..=total_pages` (1 when there are no pages).
    pub fn clamp(&self, page: u32) -> u32 {
        page.clamp(1, self.total_pages().max(1))
    }

    /// 0-based index of the first item on the current page
    pub fn start_index(&self) -> u64 {
        let start = u64::from(self.current_page - 1) * u64::from(self.items_per_page);
        start.min(self.total_items)
    }

    /// 0-based, exclusive
    pub fn end_index(&self) -> u64 {
        (self.start_index() + u64::from(self.items_per_page)).min(self.total_items)
    }

    /// 1-based inclusive range for "Showing 21-25 of 25"
    pub fn display_range(&self) -> Option<(u64, u64)> {
        (self.total_items > 0).then(|| (self.start_index() + 1, self.end_index()))
    }

    pub fn has_prev(&self) -> bool {
        self.current_page > 1
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.total_pages()
    }

    /// Current page of an in-memory list.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = (self.start_index() as usize).min(items.len());
        let end = (self.end_index() as usize).min(items.len());
        &items[start..end]
    }

    /// Page buttons: first, last, and `siblings` pages on each side of the
    /// current one, with an ellipsis wherever more than one page is skipped.
    pub fn window(&self, siblings: u32) -> Vec<PageLink> {
        let total = self.total_pages();
        if total == 0 {
            return Vec::new();
        }

        let low = self.current_page.saturating_sub(siblings).max(1);
        let high = (self.current_page + siblings).min(total);

        let mut pages: Vec<u32> = vec![1];
        pages.extend(low..=high);
        pages.push(total);
        pages.sort_unstable();
        pages.dedup();

        let mut links = Vec::with_capacity(pages.len() + 2);
        let mut prev: Option<u32> = None;
        for page in pages {
            if let Some(p) = prev {
                match page - p {
                    1 => {}
                    // one skipped page is shown instead of an ellipsis
                    2 => links.push(PageLink::Page(p + 1)),
                    _ => links.push(PageLink::Ellipsis),
                }
            }
            links.push(PageLink::Page(page));
            prev = Some(page);
        }
        links
    }

    pub fn summary(&self) -> PageSummary {
        PageSummary {
            current_page: self.current_page,
            items_per_page: self.items_per_page,
            total_items: self.total_items,
            total_pages: self.total_pages(),
            start_index: self.start_index(),
            end_index: self.end_index(),
            has_prev: self.has_prev(),
            has_next: self.has_next(),
            links: self.window(1),
        }
    }
}

/// Serializable view for the UI's pagination bar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub current_page: u32,
    pub items_per_page: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub start_index: u64,
    pub end_index: u64,
    pub has_prev: bool,
    pub has_next: bool,
    pub links: Vec<PageLink>,
}
