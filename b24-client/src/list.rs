// List iteration over `*.list` methods.
//
// Id-cursor: each page filters `>{id}` past the last seen id, sorts by id
// ascending and disables counting (`start=-1`). Offset: follows the `next`
// value the server returns. Both stop on an empty page and keep exactly one
// request in flight.

use crate::client::{B24Client, CallOptions};
use b24_core::{B24Error, PageCursor, Paging, ResultEnvelope};
use futures::stream::{self, Stream};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone)]
enum Strategy {
    IdCursor {
        id_key: String,
        last_id: Option<Value>,
    },
    Offset {
        next: Option<u64>,
    },
}

/// Pull-based page source; one call to [`ListPager::next_page`] issues at
/// most one request.
#[derive(Debug)]
pub struct ListPager<'a> {
    client: &'a B24Client,
    method: String,
    params: Value,
    result_key: Option<String>,
    strategy: Strategy,
    options: CallOptions,
    pages: usize,
    done: bool,
}

impl<'a> ListPager<'a> {
    pub fn by_id(
        client: &'a B24Client,
        method: &str,
        params: Value,
        id_key: &str,
        result_key: Option<&str>,
    ) -> Self {
        Self::new(
            client,
            method,
            params,
            result_key,
            Strategy::IdCursor {
                id_key: id_key.to_string(),
                last_id: None,
            },
        )
    }

    pub fn by_offset(
        client: &'a B24Client,
        method: &str,
        params: Value,
        result_key: Option<&str>,
    ) -> Self {
        Self::new(
            client,
            method,
            params,
            result_key,
            Strategy::Offset { next: None },
        )
    }

    fn new(
        client: &'a B24Client,
        method: &str,
        params: Value,
        result_key: Option<&str>,
        strategy: Strategy,
    ) -> Self {
        let params = match params {
            Value::Object(_) => params,
            _ => Value::Object(Map::new()),
        };
        Self {
            client,
            method: method.to_string(),
            params,
            result_key: result_key.map(str::to_string),
            strategy,
            options: CallOptions::default(),
            pages: 0,
            done: false,
        }
    }

    /// Timeout, cancellation and version applied to every page request;
    /// paging is always chosen by the pager
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Pages fetched so far
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page.
    ///
    /// `Ok(None)` once the list is exhausted. An API error ends iteration
    /// and is returned as [`B24Error::Api`].
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, B24Error> {
        if self.done {
            return Ok(None);
        }
        // an error anywhere below ends the iteration
        self.done = true;

        let (params, paging) = self.page_request();
        let options = CallOptions {
            paging,
            ..self.options.clone()
        };
        let envelope = self.client.call_with(&self.method, params, options).await?;
        let next = envelope.pagination().next.clone();
        let data = envelope.into_result()?;
        let items = extract_items(data, self.result_key.as_deref());
        self.pages += 1;

        debug!(
            method = %self.method,
            page = self.pages,
            items = items.len(),
            "Fetched list page"
        );
        if items.is_empty() {
            return Ok(None);
        }

        match &mut self.strategy {
            Strategy::IdCursor { id_key, last_id } => {
                let page_last = items
                    .last()
                    .and_then(|item| item.get(id_key.as_str()))
                    .cloned()
                    .unwrap_or(Value::Null);
                let advanced = match last_id {
                    Some(prev) => compare_ids(&page_last, prev) == Some(Ordering::Greater),
                    None => !page_last.is_null(),
                };
                if !advanced {
                    return Err(B24Error::CursorStalled {
                        method: self.method.clone(),
                        last_id: last_id.clone().unwrap_or(page_last),
                    });
                }
                *last_id = Some(page_last);
                self.done = false;
            }
            Strategy::Offset { next: slot } => match next {
                Some(PageCursor::Offset(n)) => {
                    if slot.is_some_and(|prev| n <= prev) {
                        return Err(B24Error::CursorStalled {
                            method: self.method.clone(),
                            last_id: Value::from(n),
                        });
                    }
                    *slot = Some(n);
                    self.done = false;
                }
                // no `next`: this was the last page
                _ => {}
            },
        }
        Ok(Some(items))
    }

    fn page_request(&self) -> (Value, Paging) {
        let mut params = self.params.clone();
        match &self.strategy {
            Strategy::IdCursor { id_key, last_id } => {
                if let Value::Object(map) = &mut params {
                    let filter = map
                        .entry("filter")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let (Value::Object(filter), Some(id)) = (filter, last_id) {
                        filter.insert(format!(">{}", id_key), id.clone());
                    }
                    let mut order = Map::new();
                    order.insert(id_key.clone(), Value::from("ASC"));
                    map.insert("order".to_string(), Value::Object(order));
                }
                (params, Paging::WithoutCount)
            }
            Strategy::Offset { next } => (params, next.map(Paging::Offset).unwrap_or_default()),
        }
    }

    /// Turn the pager into a lazy stream of pages.
    ///
    /// An error is yielded once, after which the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Value>, B24Error>> + 'a {
        stream::unfold(self, |mut pager| async move {
            match pager.next_page().await {
                Ok(Some(items)) => Some((Ok(items), pager)),
                Ok(None) => None,
                Err(e) => Some((Err(e), pager)),
            }
        })
    }

    /// Drain every page into one envelope; an API error yields a failed
    /// envelope carrying the items read so far
    pub async fn collect_all(mut self) -> Result<ResultEnvelope<Vec<Value>>, B24Error> {
        let mut items = Vec::new();
        loop {
            match self.next_page().await {
                Ok(Some(page)) => items.extend(page),
                Ok(None) => return Ok(ResultEnvelope::success(items)),
                Err(B24Error::Api(err)) => return Ok(ResultEnvelope::partial(items, vec![err])),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Items of one page: `data[result_key]` when given, otherwise the result
/// itself when it is an array
fn extract_items(data: Option<Value>, result_key: Option<&str>) -> Vec<Value> {
    let data = match (data, result_key) {
        (Some(Value::Object(mut obj)), Some(key)) => obj.remove(key),
        (data, _) => data,
    };
    match data {
        Some(Value::Array(items)) => items,
        // some list methods key rows by id
        Some(Value::Object(rows)) => rows.into_iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    }
}

/// Ids arrive as numbers or numeric strings
fn compare_ids(a: &Value, b: &Value) -> Option<Ordering> {
    fn numeric(v: &Value) -> Option<i64> {
        match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

impl B24Client {
    /// Read a whole list eagerly with the id cursor
    pub async fn call_fast_list_method(
        &self,
        method: &str,
        params: Value,
        id_key: &str,
        result_key: Option<&str>,
    ) -> Result<ResultEnvelope<Vec<Value>>, B24Error> {
        ListPager::by_id(self, method, params, id_key, result_key)
            .collect_all()
            .await
    }

    /// Lazy page stream with the id cursor; dropping it stops fetching
    pub fn fetch_list_method<'a>(
        &'a self,
        method: &str,
        params: Value,
        id_key: &str,
        result_key: Option<&str>,
    ) -> impl Stream<Item = Result<Vec<Value>, B24Error>> + 'a {
        ListPager::by_id(self, method, params, id_key, result_key).into_stream()
    }

    /// Read a whole list eagerly by following `next` offsets
    pub async fn call_list_method(
        &self,
        method: &str,
        params: Value,
        result_key: Option<&str>,
    ) -> Result<ResultEnvelope<Vec<Value>>, B24Error> {
        ListPager::by_offset(self, method, params, result_key)
            .collect_all()
            .await
    }

    /// Lazy page stream following `next` offsets
    pub fn fetch_offset_list_method<'a>(
        &'a self,
        method: &str,
        params: Value,
        result_key: Option<&str>,
    ) -> impl Stream<Item = Result<Vec<Value>, B24Error>> + 'a {
        ListPager::by_offset(self, method, params, result_key).into_stream()
    }
}
