use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use loglens_core::error::Result;
use loglens_core::traits::{ObjectStore, Reasoner};

use crate::graph::state::{keys, Delta, SharedState};
use crate::graph::{Capability, Worker};

/// One bar chart as requested from the reasoner.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChartSpec {
    pub title: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ChartSet {
    #[serde(default)]
    charts: Vec<ChartSpec>,
}

/// Draws charts for the analysis and stores them as SVG.
pub struct VisualizationWorker {
    name: String,
    reasoner: Arc<dyn Reasoner>,
    store: Arc<dyn ObjectStore>,
    max_charts: usize,
}

impl VisualizationWorker {
    pub fn new(
        name: impl Into<String>,
        reasoner: Arc<dyn Reasoner>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            reasoner,
            store,
            max_charts: 2,
        }
    }

    pub fn with_max_charts(mut self, max_charts: usize) -> Self {
        self.max_charts = max_charts.max(1);
        self
    }

    fn prompt(&self) -> String {
        format!(
            "Turn the forensic analysis below into at most {} bar charts. Respond with JSON only, \
             shaped as {{\"charts\": [{{\"title\": \"...\", \"labels\": [\"...\"], \"values\": [0]}}]}}. \
             Labels and values must have the same length.",
            self.max_charts
        )
    }
}

impl Worker for VisualizationWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Visualization
    }

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        Box::pin(async move {
            let Some(analysis) = state.analysis_result() else {
                return Ok(Delta::failed(&self.name, "There is no analysis to visualize yet"));
            };

            let response = self.reasoner.reason(&self.prompt(), analysis).await?;
            let charts = match parse_charts(&response) {
                Ok(charts) => charts,
                Err(reason) => {
                    warn!(node = %self.name, %reason, "Chart data unusable");
                    return Ok(Delta::incomplete(
                        &self.name,
                        format!("Could not build charts: {}", reason),
                    ));
                }
            };

            let job_id = &state.request().job_id;
            let mut images = Vec::new();
            for (i, chart) in charts.iter().take(self.max_charts).enumerate() {
                let svg = render_bar_chart(chart);
                let key = format!("charts/{}/chart{}.svg", job_id, i + 1);
                let url = self.store.store(&key, svg.into_bytes()).await?;
                images.push(url);
            }

            info!(node = %self.name, charts = images.len(), "Charts stored");
            Ok(Delta::complete(
                &self.name,
                format!("Rendered {} chart(s): {}", images.len(), images.join(", ")),
            )
            .with_artifact(keys::IMAGES, serde_json::json!(images)))
        })
    }
}

/// Parse `{"charts": [...]}`, optionally inside a code fence. Charts without
/// any bars are dropped; an empty result is an error.
pub fn parse_charts(text: &str) -> std::result::Result<Vec<ChartSpec>, String> {
    let trimmed = text.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Err("response contains no JSON object".to_string()),
    };
    let set: ChartSet = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let charts: Vec<ChartSpec> = set
        .charts
        .into_iter()
        .filter(|c| !c.labels.is_empty() && !c.values.is_empty())
        .collect();
    if charts.is_empty() {
        return Err("no chart has any data".to_string());
    }
    Ok(charts)
}

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 360.0;
const MARGIN: f64 = 48.0;

/// Render a bar chart as a standalone SVG document.
pub fn render_bar_chart(chart: &ChartSpec) -> String {
    let bars: Vec<(&str, f64)> = chart
        .labels
        .iter()
        .map(String::as_str)
        .zip(chart.values.iter().map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 }))
        .collect();
    let max = bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);
    let plot_w = WIDTH - 2.0 * MARGIN;
    let plot_h = HEIGHT - 2.0 * MARGIN;
    let slot = plot_w / bars.len().max(1) as f64;
    let bar_w = slot * 0.7;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="sans-serif">"#,
        w = WIDTH,
        h = HEIGHT
    ));
    svg.push_str(r#"<rect width="100%" height="100%" fill="white"/>"#);
    svg.push_str(&format!(
        r#"<text x="{}" y="28" text-anchor="middle" font-size="16">{}</text>"#,
        WIDTH / 2.0,
        escape_xml(&chart.title)
    ));
    svg.push_str(&format!(
        r#"<line x1="{m}" y1="{b}" x2="{r}" y2="{b}" stroke="black"/>"#,
        m = MARGIN,
        r = WIDTH - MARGIN,
        b = HEIGHT - MARGIN
    ));

    for (i, (label, value)) in bars.iter().enumerate() {
        let h = if max > 0.0 { value / max * plot_h } else { 0.0 };
        let x = MARGIN + i as f64 * slot + (slot - bar_w) / 2.0;
        let y = HEIGHT - MARGIN - h;
        svg.push_str(&format!(
            r#"<rect x="{x:.1}" y="{y:.1}" width="{bar_w:.1}" height="{h:.1}" fill="steelblue"/>"#
        ));
        svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="11">{}</text>"#,
            x + bar_w / 2.0,
            y - 4.0,
            value
        ));
        svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="11">{}</text>"#,
            x + bar_w / 2.0,
            HEIGHT - MARGIN + 16.0,
            escape_xml(label)
        ));
    }
    svg.push_str("</svg>");
    svg
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_charts() {
        let text = "```json\n{\"charts\": [{\"title\": \"Levels\", \"labels\": [\"Error\", \"Warning\"], \"values\": [3, 1]}]}\n```";
        let charts = parse_charts(text).unwrap();
        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0].values, vec![3.0, 1.0]);
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(parse_charts("no charts today").is_err());
        assert!(parse_charts(r#"{"charts": []}"#).is_err());
        assert!(parse_charts(r#"{"charts": [{"title": "t", "labels": [], "values": []}]}"#).is_err());
    }

    #[test]
    fn test_render_escapes_and_draws_bars() {
        let chart = ChartSpec {
            title: "Errors <by> source & level".into(),
            labels: vec!["A".into(), "B".into(), "C".into()],
            values: vec![2.0, 4.0, -1.0],
        };
        let svg = render_bar_chart(&chart);
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("Errors &lt;by&gt; source &amp; level"));
        assert_eq!(svg.matches("fill=\"steelblue\"").count(), 3);
    }

    #[test]
    fn test_render_labels_every_bar() {
        let chart = ChartSpec {
            title: "Events by level".into(),
            labels: vec!["Error".into(), "Information".into()],
            values: vec![2.0, 1.0],
        };
        let svg = render_bar_chart(&chart);
        assert!(svg.contains(">Error</text>"));
        assert!(svg.contains(">Information</text>"));
        assert!(svg.contains(">2</text>"));
        assert!(svg.contains(r#"height="264.0""#));

        let empty = render_bar_chart(&ChartSpec {
            title: "Nothing".into(),
            labels: vec![],
            values: vec![],
        });
        assert!(empty.contains(">Nothing</text>"));
        assert_eq!(empty.matches("fill=\"steelblue\"").count(), 0);
        assert!(empty.ends_with("</svg>"));
    }
}
