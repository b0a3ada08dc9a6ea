use std::sync::atomic::Ordering;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

use gwcore::Metrics;

use crate::state::AppState;

pub fn render_metrics(metrics: &Metrics) -> String {
    format!(
        "gwd_requests_total {}\n\
         gwd_requests_inflight {}\n\
         gwd_responses_2xx {}\n\
         gwd_responses_4xx {}\n\
         gwd_responses_5xx {}\n\
         gwd_client_disconnects_total {}\n\
         gwd_engine_starts_total {}\n\
         gwd_idle_stops_total {}\n\
         gwd_upstream_errors_timeout_total {}\n\
         gwd_upstream_errors_connect_total {}\n\
         gwd_upstream_errors_other_total {}\n",
        metrics.requests_total.load(Ordering::Relaxed),
        metrics.requests_inflight.load(Ordering::Relaxed),
        metrics.status_2xx.load(Ordering::Relaxed),
        metrics.status_4xx.load(Ordering::Relaxed),
        metrics.status_5xx.load(Ordering::Relaxed),
        metrics.client_disconnects_total.load(Ordering::Relaxed),
        metrics.engine_starts_total.load(Ordering::Relaxed),
        metrics.idle_stops_total.load(Ordering::Relaxed),
        metrics.upstream_errors_timeout.load(Ordering::Relaxed),
        metrics.upstream_errors_connect.load(Ordering::Relaxed),
        metrics.upstream_errors_other.load(Ordering::Relaxed),
    )
}

pub async fn metrics_handler(State(st): State<AppState>) -> String {
    render_metrics(&st.metrics)
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_zeroed_counters() {
        let m = Metrics::default();
        let text = render_metrics(&m);
        assert!(text.contains("gwd_requests_total 0"));
        assert!(text.contains("gwd_idle_stops_total 0"));
        assert!(text.contains("gwd_upstream_errors_timeout_total 0"));
    }
}
