//! Scripted stand-in for the POI service used by crawler tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::models::{Poi, PoiQuery, PoiResponse};
use super::{ApiError, PoiApi};
use crate::region::BoundingBox;

type CountFn = Box<dyn Fn(&BoundingBox) -> u32 + Send + Sync>;
type Override = Box<dyn Fn(&PoiQuery, usize) -> Option<PoiResponse> + Send + Sync>;

/// Answers every query from a count function over the requested cell.
/// Page contents are synthesised so that ids are unique per cell and page.
pub struct FakeApi {
    count_fn: CountFn,
    overrides: Vec<Override>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<PoiQuery>>,
}

impl FakeApi {
    pub fn new(count_fn: impl Fn(&BoundingBox) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            count_fn: Box::new(count_fn),
            overrides: Vec::new(),
            latency: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Every cell reports the same count
    pub fn uniform(count: u32) -> Self {
        Self::new(move |_| count)
    }

    /// Install a hook that may replace the response for a call.
    /// The hook also sees the zero-based call index.
    pub fn with_override(
        mut self,
        hook: impl Fn(&PoiQuery, usize) -> Option<PoiResponse> + Send + Sync + 'static,
    ) -> Self {
        self.overrides.push(Box::new(hook));
        self
    }

    /// Delay every answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<PoiQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.queries().into_iter().map(|q| q.key).collect()
    }
}

/// A well-formed error response
pub fn error_response(code: u32) -> PoiResponse {
    PoiResponse {
        status: Some("0".to_string()),
        count: Some("0".to_string()),
        info: Some(format!("ERROR_{}", code)),
        infocode: Some(code.to_string()),
        pois: Some(vec![]),
    }
}

/// Parse `left,top|right,bottom` back into a box
pub fn parse_polygon(polygon: &str) -> BoundingBox {
    let numbers: Vec<f64> = polygon
        .split(|c| c == ',' || c == '|')
        .map(|n| n.parse().unwrap())
        .collect();
    BoundingBox::new(numbers[0], numbers[3], numbers[2], numbers[1])
}

#[async_trait]
impl PoiApi for FakeApi {
    async fn query(&self, query: &PoiQuery) -> Result<PoiResponse, ApiError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        for hook in &self.overrides {
            if let Some(response) = hook(query, index) {
                return Ok(response);
            }
        }

        let bounds = parse_polygon(&query.polygon);
        let count = (self.count_fn)(&bounds);
        let skip = (query.page - 1) * query.page_size;
        let on_page = count.saturating_sub(skip).min(query.page_size);
        let (lng, lat) = bounds.center();

        let pois = (0..on_page)
            .map(|i| Poi {
                id: Some(format!("{}:{}:{}:{}", bounds.left, bounds.bottom, query.page, i)),
                name: Some(format!("poi {}", i)),
                location: Some(format!("{},{}", lng, lat)),
                ..Default::default()
            })
            .collect();

        Ok(PoiResponse {
            status: Some("1".to_string()),
            count: Some(count.to_string()),
            info: Some("OK".to_string()),
            infocode: Some("10000".to_string()),
            pois: Some(pois),
        })
    }
}
