// Result envelope: one API response with success/error inspection and
// follow-up page fetching.

use crate::error::{ApiError, B24Error};
use crate::version::ApiVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side timing block attached to every response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseTime {
    pub start: Option<f64>,
    pub finish: Option<f64>,
    pub duration: Option<f64>,
    pub processing: Option<f64>,
    pub date_start: Option<String>,
    pub date_finish: Option<String>,
    /// Seconds of method execution budget consumed in the current window
    pub operating: Option<f64>,
    pub operating_reset_at: Option<i64>,
}

/// Position of the next page as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageCursor {
    Offset(u64),
    Token(String),
}

impl PageCursor {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(PageCursor::Offset),
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(
                s.parse::<u64>()
                    .map(PageCursor::Offset)
                    .unwrap_or_else(|_| PageCursor::Token(s.clone())),
            ),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PageCursor::Offset(n) => Value::from(*n),
            PageCursor::Token(s) => Value::from(s.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: Option<u64>,
    pub next: Option<PageCursor>,
}

/// Offset selection for a list call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Paging {
    /// Let the server apply its default
    #[default]
    Default,
    Offset(u64),
    /// `start=-1`: skip counting the total, the fastest way to read a list
    WithoutCount,
}

impl Paging {
    /// Sentinel understood by the server as "do not count"
    pub const WITHOUT_COUNT: i64 = -1;

    pub fn start_value(&self) -> Option<Value> {
        match self {
            Paging::Default => None,
            Paging::Offset(n) => Some(Value::from(*n)),
            Paging::WithoutCount => Some(Value::from(Self::WITHOUT_COUNT)),
        }
    }
}

/// The call that produced an envelope, kept for `get_next`
#[derive(Debug, Clone, PartialEq)]
pub struct CallOrigin {
    pub method: String,
    pub params: Value,
    pub version: ApiVersion,
}

/// Anything able to issue a single call; implemented by the dispatcher
#[async_trait]
pub trait CallMethod: Send + Sync {
    async fn call_versioned(
        &self,
        method: &str,
        params: Value,
        version: ApiVersion,
        paging: Paging,
    ) -> Result<ResultEnvelope, B24Error>;
}

/// Wrapped API response.
///
/// API-level failures are carried in `errors`; callers branch on
/// [`ResultEnvelope::is_success`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope<T = Value> {
    data: Option<T>,
    errors: Vec<ApiError>,
    time: Option<ResponseTime>,
    pagination: Pagination,
    status: Option<u16>,
    origin: Option<CallOrigin>,
}

impl<T> ResultEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
            time: None,
            pagination: Pagination::default(),
            status: None,
            origin: None,
        }
    }

    pub fn failure(errors: Vec<ApiError>) -> Self {
        Self {
            data: None,
            errors,
            time: None,
            pagination: Pagination::default(),
            status: None,
            origin: None,
        }
    }

    /// Envelope that carries both partial data and errors
    pub fn partial(data: T, errors: Vec<ApiError>) -> Self {
        Self {
            data: Some(data),
            errors,
            time: None,
            pagination: Pagination::default(),
            status: None,
            origin: None,
        }
    }

    pub fn with_time(mut self, time: Option<ResponseTime>) -> Self {
        self.time = time;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_origin(mut self, origin: CallOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn errors(&self) -> &[ApiError] {
        &self.errors
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn time(&self) -> Option<&ResponseTime> {
        self.time.as_ref()
    }

    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    pub fn total(&self) -> Option<u64> {
        self.pagination.total
    }

    pub fn has_next(&self) -> bool {
        self.pagination.next.is_some()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn origin(&self) -> Option<&CallOrigin> {
        self.origin.as_ref()
    }

    /// Convert into a plain `Result`, surfacing the first API error
    pub fn into_result(self) -> Result<Option<T>, B24Error> {
        match self.errors.into_iter().next() {
            Some(err) => Err(B24Error::Api(err)),
            None => Ok(self.data),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResultEnvelope<U> {
        ResultEnvelope {
            data: self.data.map(f),
            errors: self.errors,
            time: self.time,
            pagination: self.pagination,
            status: self.status,
            origin: self.origin,
        }
    }
}

impl ResultEnvelope<Value> {
    /// Build an envelope from a decoded response body
    pub fn from_payload(status: u16, payload: Value) -> Self {
        let time = payload
            .get("time")
            .and_then(|t| serde_json::from_value::<ResponseTime>(t.clone()).ok());

        if let Some(err) = ApiError::from_payload(&payload) {
            return ResultEnvelope::failure(vec![err.with_status(status)])
                .with_time(time)
                .with_status(status);
        }

        let pagination = Pagination {
            total: payload.get("total").and_then(Value::as_u64),
            next: payload.get("next").and_then(PageCursor::from_value),
        };

        let data = match payload {
            Value::Object(mut obj) => obj.remove("result").unwrap_or(Value::Null),
            _ => Value::Null,
        };

        ResultEnvelope::success(data)
            .with_time(time)
            .with_pagination(pagination)
            .with_status(status)
    }

    /// Fetch the following page using the carried cursor.
    ///
    /// Returns `Ok(None)` when the server reported no further page. `self`
    /// is left untouched.
    pub async fn get_next<C>(&self, caller: &C) -> Result<Option<ResultEnvelope>, B24Error>
    where
        C: CallMethod + ?Sized,
    {
        let Some(next) = &self.pagination.next else {
            return Ok(None);
        };
        let origin = self.origin.as_ref().ok_or_else(|| {
            B24Error::configuration("envelope has a next page but no originating call")
        })?;

        let mut params = origin.params.clone();
        let paging = match next {
            PageCursor::Offset(n) => Paging::Offset(*n),
            PageCursor::Token(token) => {
                if let Value::Object(map) = &mut params {
                    map.insert("start".to_string(), Value::from(token.as_str()));
                }
                Paging::Default
            }
        };

        tracing::debug!(method = %origin.method, next = ?next, "Fetching next page");
        let envelope = caller
            .call_versioned(&origin.method, params, origin.version, paging)
            .await?;
        Ok(Some(envelope))
    }
}
