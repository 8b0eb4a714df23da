//! Page-number pagination for list endpoints.
//!
//! Responses carry the shape `{links: {next, previous}, count, page,
//! total_pages, results}`. Page size defaults to 25 and is capped at 100.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

/// Query parameters accepted by paginated endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<usize>,
    pub size: Option<usize>,
}

impl PageParams {
    /// The 1-based page number to serve.
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    /// The page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn size(&self) -> usize {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    /// Offset of the first item of the requested page.
    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.size()
    }
}

/// Links to the neighbouring pages, when they exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLinks {
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// A single page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub links: PageLinks,
    pub count: usize,
    pub page: usize,
    pub total_pages: usize,
    pub results: Vec<T>,
}

/// Build a page over an already-filtered item list.
///
/// `base_path` is used to render the next/previous links.
pub fn paginate<T>(items: Vec<T>, params: &PageParams, base_path: &str) -> Paginated<T> {
    let count = items.len();
    let size = params.size();
    let total_pages = count.div_ceil(size).max(1);
    let page = params.page().min(total_pages);

    let results: Vec<T> = items
        .into_iter()
        .skip((page - 1) * size)
        .take(size)
        .collect();

    let link = |p: usize| format!("{base_path}?page={p}&size={size}");

    Paginated {
        links: PageLinks {
            next: (page < total_pages).then(|| link(page + 1)),
            previous: (page > 1).then(|| link(page - 1)),
        },
        count,
        page,
        total_pages,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_defaults_to_25() {
        let params = PageParams::default();
        assert_eq!(params.size(), 25);
        assert_eq!(params.page(), 1);
    }

    #[test]
    fn size_is_clamped_to_100() {
        let params = PageParams {
            page: None,
            size: Some(500),
        };
        assert_eq!(params.size(), 100);

        let params = PageParams {
            page: None,
            size: Some(0),
        };
        assert_eq!(params.size(), 1);
    }

    #[test]
    fn paginate_splits_and_links() {
        let items: Vec<i32> = (0..60).collect();
        let params = PageParams {
            page: Some(2),
            size: Some(25),
        };
        let page = paginate(items, &params, "/tasks/eventizer");

        assert_eq!(page.count, 60);
        assert_eq!(page.page, 2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.results.len(), 25);
        assert_eq!(page.results[0], 25);
        assert_eq!(
            page.links.next.as_deref(),
            Some("/tasks/eventizer?page=3&size=25")
        );
        assert_eq!(
            page.links.previous.as_deref(),
            Some("/tasks/eventizer?page=1&size=25")
        );
    }

    #[test]
    fn paginate_empty_list_is_a_single_page() {
        let page = paginate(Vec::<i32>::new(), &PageParams::default(), "/tasks/unify");
        assert_eq!(page.count, 0);
        assert_eq!(page.total_pages, 1);
        assert!(page.links.next.is_none());
        assert!(page.links.previous.is_none());
    }

    #[test]
    fn paginate_clamps_page_past_the_end() {
        let items: Vec<i32> = (0..10).collect();
        let params = PageParams {
            page: Some(9),
            size: Some(25),
        };
        let page = paginate(items, &params, "/tasks/eventizer");
        assert_eq!(page.page, 1);
        assert_eq!(page.results.len(), 10);
    }
}
