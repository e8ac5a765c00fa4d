//! Paginated list with optimistic mutations
//!
//! Every list screen keeps one page of server data in a [`ResourceList`].
//! Mutations patch the local page first, then call the backend, then either
//! confirm (swap in the server's record) or roll back. Each operation comes
//! as a `begin_*` / `finish_*` pair so a caller holding the list behind a
//! lock can release it while the request is in flight; the `async`
//! wrappers do both halves in one call.
//!
//! Invariants:
//! - a failed update or delete puts back only the rows it changed, so with
//!   nothing else in flight the list equals its pre-change snapshot, and
//!   mutations confirmed in between survive;
//! - a failed create removes only its temporary entry;
//! - a page reloaded while a mutation was in flight is not rolled back;
//! - a fetch result older than the latest issued fetch is dropped;
//! - a record with a mutation in flight rejects another one (`Busy`).

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::api::{ListQuery, Resource, ResourceBackend, SortDirection, SortSpec};
use crate::error::{AppError, AppResult};
use crate::filters::ListFilter;
use crate::models::Page;
use crate::pagination::{PageSummary, Pagination};
use crate::toast::Toaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ItemKey {
    Server(i64),
    /// Client-side id of a record the server has not confirmed yet
    Temp(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListItem<R> {
    pub key: ItemKey,
    pub record: R,
}

impl<R: Resource> ListItem<R> {
    fn saved(record: R) -> Self {
        Self {
            key: ItemKey::Server(record.id()),
            record,
        }
    }
}

/// Items and total as they were at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<R> {
    pub items: Vec<ListItem<R>>,
    pub total: u64,
}

#[derive(Debug)]
pub struct FetchTicket {
    seq: u64,
    pub query: ListQuery,
}

#[derive(Debug)]
pub struct PendingCreate {
    pub key: ItemKey,
}

#[derive(Debug)]
pub struct PendingUpdate<R> {
    pub id: i64,
    previous: R,
    loaded: u64,
}

#[derive(Debug)]
pub struct PendingDelete<R> {
    pub ids: Vec<i64>,
    snapshot: Snapshot<R>,
    loaded: u64,
}

pub struct ResourceList<R: Resource, F: ListFilter> {
    items: Vec<ListItem<R>>,
    total: u64,
    filter: F,
    sort: Option<SortSpec>,
    current_page: u32,
    items_per_page: u32,
    in_flight: HashSet<ItemKey>,
    fetch_seq: u64,
    /// Sequence of the fetch whose page is currently shown
    loaded_seq: u64,
    loading: bool,
    toaster: Toaster,
}

impl<R: Resource, F: ListFilter> ResourceList<R, F> {
    pub fn new(items_per_page: u32, toaster: Toaster) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            filter: F::default(),
            sort: None,
            current_page: 1,
            items_per_page: items_per_page.max(1),
            in_flight: HashSet::new(),
            fetch_seq: 0,
            loaded_seq: 0,
            loading: false,
            toaster,
        }
    }

    // ============ State ============

    pub fn items(&self) -> &[ListItem<R>] {
        &self.items
    }

    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.items.iter().map(|item| &item.record)
    }

    pub fn find(&self, id: i64) -> Option<&R> {
        self.position(ItemKey::Server(id)).map(|i| &self.items[i].record)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn sort(&self) -> Option<&SortSpec> {
        self.sort.as_ref()
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn items_per_page(&self) -> u32 {
        self.items_per_page
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_pending(&self, key: &ItemKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.current_page, self.items_per_page, self.total)
    }

    pub fn snapshot(&self) -> Snapshot<R> {
        Snapshot {
            items: self.items.clone(),
            total: self.total,
        }
    }

    /// Puts back the rows of `snapshot` listed in `removed` that are missing
    /// now, each after the nearest earlier snapshot row still present.
    /// Returns how many rows came back.
    fn reinsert(&mut self, snapshot: Snapshot<R>, removed: &[ItemKey]) -> u64 {
        let mut anchor: Option<ItemKey> = None;
        let mut restored = 0;
        for item in snapshot.items {
            if self.position(item.key).is_some() {
                anchor = Some(item.key);
                continue;
            }
            if !removed.contains(&item.key) {
                continue;
            }
            let index = anchor.and_then(|k| self.position(k)).map_or(0, |i| i + 1);
            anchor = Some(item.key);
            self.items.insert(index, item);
            restored += 1;
        }
        restored
    }

    fn position(&self, key: ItemKey) -> Option<usize> {
        self.items.iter().position(|item| item.key == key)
    }

    fn label(&self) -> String {
        R::LABEL.to_lowercase()
    }

    // ============ Inputs ============

    /// Returns whether the filter changed. A change sends the list back to page 1.
    pub fn set_filter(&mut self, filter: F) -> bool {
        if filter == self.filter {
            return false;
        }
        self.filter = filter;
        self.current_page = 1;
        true
    }

    pub fn reset_filters(&mut self) {
        self.filter = F::default();
        self.current_page = 1;
    }

    pub fn set_page(&mut self, page: u32) {
        self.current_page = if self.total > 0 {
            self.pagination().clamp(page)
        } else {
            page.max(1)
        };
    }

    pub fn set_page_size(&mut self, items_per_page: u32) {
        let items_per_page = items_per_page.max(1);
        if items_per_page != self.items_per_page {
            self.items_per_page = items_per_page;
            self.current_page = 1;
        }
    }

    pub fn set_sort(&mut self, sort: Option<SortSpec>) {
        if sort != self.sort {
            self.sort = sort;
            self.current_page = 1;
        }
    }

    /// Clicking a column header: same column flips direction, new column starts ascending.
    pub fn toggle_sort(&mut self, field: &str) {
        let direction = match &self.sort {
            Some(sort) if sort.field == field => sort.direction.toggled(),
            _ => SortDirection::Asc,
        };
        self.set_sort(Some(SortSpec {
            field: field.to_string(),
            direction,
        }));
    }

    pub fn query(&self) -> ListQuery {
        ListQuery {
            page: self.current_page,
            per_page: self.items_per_page,
            filters: self.filter.query_pairs(),
            sort: self.sort.clone(),
        }
    }

    // ============ Fetch ============

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_seq += 1;
        self.loading = true;
        FetchTicket {
            seq: self.fetch_seq,
            query: self.query(),
        }
    }

    /// Applies a fetch result. Returns `false` when the result was stale and dropped.
    pub fn finish_fetch(&mut self, ticket: FetchTicket, result: &AppResult<Page<R>>) -> bool {
        if ticket.seq != self.fetch_seq {
            log::debug!(
                "[list] dropping stale {} response (seq {} < {})",
                self.label(),
                ticket.seq,
                self.fetch_seq
            );
            return false;
        }
        self.loading = false;

        match result {
            Ok(page) => {
                self.items = page.items.iter().cloned().map(ListItem::saved).collect();
                self.total = page.total;
                self.loaded_seq = ticket.seq;
            }
            Err(e) => {
                log::error!("[list] failed to load {}s: {}", self.label(), e);
                self.toaster
                    .error(format!("Failed to load {}s", self.label()), e.user_message());
            }
        }
        true
    }

    pub async fn refresh<B>(&mut self, backend: &B) -> AppResult<()>
    where
        B: ResourceBackend<R> + ?Sized,
    {
        let ticket = self.begin_fetch();
        let result = backend.list(&ticket.query).await;
        self.finish_fetch(ticket, &result);
        result.map(|_| ())
    }

    // ============ Create ============

    pub fn begin_create(&mut self, draft: &R::Draft) -> AppResult<PendingCreate> {
        R::validate(draft).map_err(AppError::Validation)?;

        let key = ItemKey::Temp(Uuid::new_v4());
        self.items.insert(
            0,
            ListItem {
                key,
                record: R::preview(draft),
            },
        );
        self.total += 1;
        self.in_flight.insert(key);
        Ok(PendingCreate { key })
    }

    pub fn finish_create(&mut self, pending: PendingCreate, result: AppResult<R>) -> AppResult<R> {
        self.in_flight.remove(&pending.key);
        let position = self.position(pending.key);

        match result {
            Ok(record) => {
                if let Some(i) = position {
                    self.items[i] = ListItem::saved(record.clone());
                }
                self.toaster.success(
                    format!("{} created", R::LABEL),
                    format!("'{}' was added", record.display_name()),
                );
                Ok(record)
            }
            Err(e) => {
                // a refresh may already have replaced the page; then there is nothing to undo
                if let Some(i) = position {
                    self.items.remove(i);
                    self.total = self.total.saturating_sub(1);
                }
                self.toaster
                    .error(format!("Failed to create {}", self.label()), e.user_message());
                Err(e)
            }
        }
    }

    pub async fn create<B>(&mut self, backend: &B, draft: &R::Draft) -> AppResult<R>
    where
        B: ResourceBackend<R> + ?Sized,
    {
        let pending = self.begin_create(draft)?;
        let result = backend.create(draft).await;
        self.finish_create(pending, result)
    }

    // ============ Update ============

    fn ensure_idle(&self, keys: &[ItemKey]) -> AppResult<()> {
        if keys.iter().any(|k| self.in_flight.contains(k)) {
            let err = AppError::Busy(R::LABEL.to_string());
            self.toaster.error("Please wait", err.user_message());
            return Err(err);
        }
        Ok(())
    }

    pub fn begin_update(&mut self, id: i64, draft: &R::Draft) -> AppResult<PendingUpdate<R>> {
        R::validate(draft).map_err(AppError::Validation)?;

        let key = ItemKey::Server(id);
        self.ensure_idle(&[key])?;
        let index = self
            .position(key)
            .ok_or_else(|| AppError::NotFound(format!("{} {}", R::LABEL, id)))?;

        let previous = self.items[index].record.clone();
        self.items[index].record = R::preview_update(&previous, draft);
        self.in_flight.insert(key);
        Ok(PendingUpdate {
            id,
            previous,
            loaded: self.loaded_seq,
        })
    }

    pub fn finish_update(&mut self, pending: PendingUpdate<R>, result: AppResult<R>) -> AppResult<R> {
        let key = ItemKey::Server(pending.id);
        self.in_flight.remove(&key);

        match result {
            Ok(record) => {
                if let Some(i) = self.position(key) {
                    self.items[i] = ListItem::saved(record.clone());
                }
                self.toaster.success(
                    format!("{} updated", R::LABEL),
                    format!("'{}' was saved", record.display_name()),
                );
                Ok(record)
            }
            Err(e) => {
                if pending.loaded == self.loaded_seq {
                    if let Some(i) = self.position(key) {
                        self.items[i].record = pending.previous;
                    }
                }
                self.toaster
                    .error(format!("Failed to update {}", self.label()), e.user_message());
                Err(e)
            }
        }
    }

    pub async fn update<B>(&mut self, backend: &B, id: i64, draft: &R::Draft) -> AppResult<R>
    where
        B: ResourceBackend<R> + ?Sized,
    {
        let pending = self.begin_update(id, draft)?;
        let result = backend.update(id, draft).await;
        self.finish_update(pending, result)
    }

    // ============ Delete ============

    pub fn begin_delete(&mut self, ids: &[i64]) -> AppResult<PendingDelete<R>> {
        if ids.is_empty() {
            return Err(AppError::Custom(format!("No {} selected", self.label())));
        }
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let keys: Vec<ItemKey> = ids.iter().map(|id| ItemKey::Server(*id)).collect();
        self.ensure_idle(&keys)?;

        let snapshot = self.snapshot();
        let before = self.items.len();
        self.items.retain(|item| !keys.contains(&item.key));
        let removed = (before - self.items.len()) as u64;
        self.total = self.total.saturating_sub(removed);
        self.in_flight.extend(keys);
        Ok(PendingDelete {
            ids,
            snapshot,
            loaded: self.loaded_seq,
        })
    }

    pub fn finish_delete(&mut self, pending: PendingDelete<R>, result: AppResult<()>) -> AppResult<()> {
        for id in &pending.ids {
            self.in_flight.remove(&ItemKey::Server(*id));
        }

        match result {
            Ok(()) => {
                let message = match pending.ids.len() {
                    1 => format!("1 {} removed", self.label()),
                    n => format!("{} {}s removed", n, self.label()),
                };
                self.toaster.success(format!("{} deleted", R::LABEL), message);
                Ok(())
            }
            Err(e) => {
                if pending.loaded == self.loaded_seq {
                    let keys: Vec<ItemKey> = pending.ids.iter().map(|id| ItemKey::Server(*id)).collect();
                    let restored = self.reinsert(pending.snapshot, &keys);
                    self.total += restored;
                }
                self.toaster
                    .error(format!("Failed to delete {}", self.label()), e.user_message());
                Err(e)
            }
        }
    }

    pub async fn delete<B>(&mut self, backend: &B, id: i64) -> AppResult<()>
    where
        B: ResourceBackend<R> + ?Sized,
    {
        let pending = self.begin_delete(&[id])?;
        let result = backend.delete(id).await;
        self.finish_delete(pending, result)
    }

    /// All-or-nothing from the list's point of view: any failure reverts every row.
    pub async fn delete_many<B>(&mut self, backend: &B, ids: &[i64]) -> AppResult<()>
    where
        B: ResourceBackend<R> + ?Sized,
    {
        let pending = self.begin_delete(ids)?;
        let result = backend.delete_many(&pending.ids).await;
        self.finish_delete(pending, result)
    }

    // ============ View ============

    pub fn view(&self) -> ListView<R, F> {
        ListView {
            items: self
                .items
                .iter()
                .map(|item| ListRow {
                    key: item.key,
                    pending: self.is_pending(&item.key),
                    record: item.record.clone(),
                })
                .collect(),
            total: self.total,
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            loading: self.loading,
            pagination: self.pagination().summary(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRow<R> {
    pub key: ItemKey,
    pub pending: bool,
    pub record: R,
}

/// What a list screen renders
#[derive(Debug, Clone, Serialize)]
pub struct ListView<R, F> {
    pub items: Vec<ListRow<R>>,
    pub total: u64,
    pub filter: F,
    pub sort: Option<SortSpec>,
    pub loading: bool,
    pub pagination: PageSummary,
}
