//! # Paging
//!
//! Page requests, sort orders and the arithmetic behind [`Page`] and [`Slice`].
//!
//! ## Page vs Slice
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────────┐
//! │ Page (count-bearing)         │ Slice (look-ahead)                       │
//! ├──────────────────────────────┼──────────────────────────────────────────┤
//! │ SELECT ... LIMIT size        │ SELECT ... LIMIT size + 1                │
//! │        OFFSET page*size      │        OFFSET page*size                  │
//! │ SELECT COUNT(*) ...          │ (no count query)                         │
//! │   unless the content already │                                          │
//! │   determines the total       │ has_next = (size + 1)th row came back    │
//! └──────────────────────────────┴──────────────────────────────────────────┘
//! ```

use serde::Serialize;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Sort
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(property: &str) -> Self {
        Order {
            property: property.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: &str) -> Self {
        Order {
            property: property.to_string(),
            direction: Direction::Desc,
        }
    }
}

/// Ordered list of sort keys. Ties are broken only by later keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Sort {
    pub orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Sort::default()
    }

    /// Ascending sort over `properties`.
    pub fn by(properties: &[&str]) -> Self {
        Sort {
            orders: properties.iter().map(|p| Order::asc(p)).collect(),
        }
    }

    pub fn by_desc(properties: &[&str]) -> Self {
        Sort {
            orders: properties.iter().map(|p| Order::desc(p)).collect(),
        }
    }

    pub fn and(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }

    /// Runtime sort wins over the static sort; static keys are appended
    /// when they are not already present.
    pub fn merged_with(&self, fallback: &Sort) -> Sort {
        let mut orders = self.orders.clone();
        for order in &fallback.orders {
            if !orders.iter().any(|o| o.property == order.property) {
                orders.push(order.clone());
            }
        }
        Sort { orders }
    }
}

// =============================================================================
// Page Request
// =============================================================================

/// Zero-based page index plus page size (always > 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    page: u32,
    size: u32,
    sort: Sort,
}

impl PageRequest {
    /// ## Errors
    /// [`CoreError::InvalidPageRequest`] when `size` is 0.
    pub fn of(page: u32, size: u32) -> CoreResult<Self> {
        if size == 0 {
            return Err(CoreError::InvalidPageRequest {
                reason: "page size must be greater than zero".to_string(),
            });
        }
        Ok(PageRequest {
            page,
            size,
            sort: Sort::unsorted(),
        })
    }

    pub fn sorted(page: u32, size: u32, sort: Sort) -> CoreResult<Self> {
        Ok(Self::of(page, size)?.with_sort(sort))
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    /// The following page. `u32::MAX` has no successor and returns itself.
    pub fn next(&self) -> PageRequest {
        PageRequest {
            page: self.page.saturating_add(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }
}

// =============================================================================
// Page and Slice
// =============================================================================

/// A page of content plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub number: u32,
    pub size: u32,
    pub total_elements: u64,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.total_elements == 0 {
            return 0;
        }
        self.total_elements.div_ceil(u64::from(self.size))
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn has_next(&self) -> bool {
        u64::from(self.number) + 1 < self.total_pages()
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            content: self.content.into_iter().map(f).collect::<Result<_, E>>()?,
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        })
    }
}

/// A page of content that only knows whether another page follows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice<T> {
    pub content: Vec<T>,
    pub number: u32,
    pub size: u32,
    pub has_next: bool,
}

impl<T> Slice<T> {
    /// Truncates `rows` fetched with a `size + 1` limit.
    pub fn from_lookahead(mut rows: Vec<T>, request: &PageRequest) -> Self {
        let size = request.size() as usize;
        let has_next = rows.len() > size;
        rows.truncate(size);
        Slice {
            content: rows,
            number: request.page(),
            size: request.size(),
            has_next,
        }
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Slice<U>, E> {
        Ok(Slice {
            content: self.content.into_iter().map(f).collect::<Result<_, E>>()?,
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        })
    }
}

// =============================================================================
// Page Computer
// =============================================================================

/// Row window pushed down to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub offset: u64,
    pub limit: u64,
}

/// Window arithmetic for pages and slices, optionally capped by `Top N`.
pub struct PageComputer;

impl PageComputer {
    /// Window for page mode. `None` means the page lies entirely past the
    /// `Top N` cap and no rows can match.
    pub fn page_window(request: &PageRequest, top: Option<u64>) -> Option<Window> {
        Self::window(request.offset(), u64::from(request.size()), top)
    }

    /// Window for slice mode: one look-ahead row beyond the page size.
    pub fn slice_window(request: &PageRequest, top: Option<u64>) -> Option<Window> {
        Self::window(request.offset(), u64::from(request.size()) + 1, top)
    }

    fn window(offset: u64, limit: u64, top: Option<u64>) -> Option<Window> {
        match top {
            None => Some(Window { offset, limit }),
            Some(n) if offset >= n => None,
            Some(n) => Some(Window {
                offset,
                limit: limit.min(n - offset),
            }),
        }
    }

    /// Total derived from the content alone, when the content proves it.
    ///
    /// - first page that is not full: total = content length
    /// - any non-empty page that is not full: total = offset + content length
    ///
    /// Otherwise a count query is required.
    pub fn total_without_count(request: &PageRequest, content_len: usize) -> Option<u64> {
        let len = content_len as u64;
        let size = u64::from(request.size());
        if request.offset() == 0 && len < size {
            return Some(len);
        }
        if len != 0 && len < size {
            return Some(request.offset() + len);
        }
        None
    }

    /// Caps a counted total at `Top N`.
    pub fn capped_total(count: u64, top: Option<u64>) -> u64 {
        match top {
            Some(n) => count.min(n),
            None => count,
        }
    }

    pub fn page<T>(request: &PageRequest, content: Vec<T>, total: u64) -> Page<T> {
        Page {
            content,
            number: request.page(),
            size: request.size(),
            total_elements: total,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            PageRequest::of(0, 0),
            Err(CoreError::InvalidPageRequest { .. })
        ));
    }

    #[test]
    fn test_next_page_keeps_size_and_sort() {
        let request = PageRequest::sorted(0, 3, Sort::by(&["username"])).unwrap();
        let next = request.next();
        assert_eq!(next.page(), 1);
        assert_eq!(next.size(), 3);
        assert_eq!(next.offset(), 3);
        assert_eq!(next.sort, request.sort);

        let last = PageRequest::of(u32::MAX, u32::MAX).unwrap();
        assert_eq!(last.next(), last);
        assert_eq!(last.next().offset(), u64::from(u32::MAX) * u64::from(u32::MAX));
    }

    #[test]
    fn test_page_arithmetic_five_rows_size_three() {
        let first = PageComputer::page(&PageRequest::of(0, 3).unwrap(), vec![1, 2, 3], 5);
        assert_eq!(first.content.len(), 3);
        assert_eq!(first.total_elements, 5);
        assert_eq!(first.total_pages(), 2);
        assert!(first.is_first());
        assert!(first.has_next());
        assert!(!first.is_last());

        let second = PageComputer::page(&PageRequest::of(1, 3).unwrap(), vec![4, 5], 5);
        assert_eq!(second.content.len(), 2);
        assert!(second.is_last());
        assert!(!second.has_next());
        assert!(second.has_previous());
    }

    #[test]
    fn test_empty_page_has_zero_pages() {
        let page: Page<i32> = PageComputer::page(&PageRequest::of(0, 3).unwrap(), vec![], 0);
        assert_eq!(page.total_pages(), 0);
        assert!(page.is_last());
    }

    #[test]
    fn test_slice_lookahead() {
        let request = PageRequest::of(0, 3).unwrap();
        assert_eq!(PageComputer::slice_window(&request, None).unwrap().limit, 4);

        let slice = Slice::from_lookahead(vec![1, 2, 3, 4], &request);
        assert_eq!(slice.content, vec![1, 2, 3]);
        assert!(slice.has_next);

        let slice = Slice::from_lookahead(vec![4, 5], &request.next());
        assert!(!slice.has_next);
        assert!(slice.is_last());
    }

    #[test]
    fn test_total_without_count() {
        let first = PageRequest::of(0, 3).unwrap();
        assert_eq!(PageComputer::total_without_count(&first, 2), Some(2));
        assert_eq!(PageComputer::total_without_count(&first, 3), None);

        let second = first.next();
        assert_eq!(PageComputer::total_without_count(&second, 2), Some(5));
        assert_eq!(PageComputer::total_without_count(&second, 0), None);
    }

    #[test]
    fn test_top_caps_window() {
        let request = PageRequest::of(1, 3).unwrap();
        assert_eq!(
            PageComputer::page_window(&request, Some(4)),
            Some(Window { offset: 3, limit: 1 })
        );
        assert_eq!(PageComputer::page_window(&request.next(), Some(4)), None);
        assert_eq!(PageComputer::capped_total(10, Some(4)), 4);
    }

    #[test]
    fn test_runtime_sort_merges_static() {
        let runtime = Sort::by_desc(&["age"]);
        let merged = runtime.merged_with(&Sort::by(&["username", "age"]));
        assert_eq!(merged.orders, vec![Order::desc("age"), Order::asc("username")]);
    }
}
