//! Self-contained HTML chart of conversion rate against click count.
//!
//! One inline SVG series per feature, a `<select>` to switch between them and
//! no external scripts, so the file renders when opened directly.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::rates::RateSample;

const WIDTH: f64 = 820.0;
const HEIGHT: f64 = 500.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 80.0;

pub const X_AXIS_TITLE: &str = "Click Count (Number of Times Feature Appears in Path)";
pub const Y_AXIS_TITLE: &str = "Conversion Rate (%)";

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn chart_title(feature: &str) -> String {
    format!("Conversion Rate vs Click Count for '{}'", feature)
}

pub fn point_label(rate: f64) -> String {
    format!("{:.1}%", rate)
}

struct Scale {
    max_count: u32,
}

impl Scale {
    fn x(&self, count: u32) -> f64 {
        let span = f64::from(self.max_count.max(1));
        MARGIN_LEFT + f64::from(count) / span * (WIDTH - MARGIN_LEFT - MARGIN_RIGHT)
    }

    fn y(&self, rate: f64) -> f64 {
        HEIGHT - MARGIN_BOTTOM - rate.clamp(0.0, 100.0) / 100.0 * (HEIGHT - MARGIN_TOP - MARGIN_BOTTOM)
    }
}

fn render_axes(out: &mut String, scale: &Scale) -> std::fmt::Result {
    let left = MARGIN_LEFT;
    let right = WIDTH - MARGIN_RIGHT;
    let bottom = HEIGHT - MARGIN_BOTTOM;

    for step in 0..=5 {
        let rate = f64::from(step) * 20.0;
        let y = scale.y(rate);
        writeln!(
            out,
            r##"<line x1="{left:.1}" y1="{y:.1}" x2="{right:.1}" y2="{y:.1}" stroke="#e5e5e5"/><text x="{tx:.1}" y="{ty:.1}" text-anchor="end" font-size="12">{rate:.0}</text>"##,
            tx = left - 8.0,
            ty = y + 4.0,
        )?;
    }
    for count in 0..=scale.max_count {
        let x = scale.x(count);
        writeln!(
            out,
            r#"<text x="{x:.1}" y="{ty:.1}" text-anchor="middle" font-size="12">{count}</text>"#,
            ty = bottom + 18.0,
        )?;
    }
    writeln!(
        out,
        r##"<line x1="{left:.1}" y1="{bottom:.1}" x2="{right:.1}" y2="{bottom:.1}" stroke="#333"/><line x1="{left:.1}" y1="{top:.1}" x2="{left:.1}" y2="{bottom:.1}" stroke="#333"/>"##,
        top = MARGIN_TOP,
    )?;
    writeln!(
        out,
        r#"<text x="{x:.1}" y="{y:.1}" text-anchor="middle" font-size="14">{title}</text>"#,
        x = (left + right) / 2.0,
        y = HEIGHT - 25.0,
        title = escape_html(X_AXIS_TITLE),
    )?;
    writeln!(
        out,
        r#"<text transform="translate(22,{y:.1}) rotate(-90)" text-anchor="middle" font-size="14">{title}</text>"#,
        y = (MARGIN_TOP + bottom) / 2.0,
        title = escape_html(Y_AXIS_TITLE),
    )
}

fn render_series(
    out: &mut String,
    index: usize,
    points: &[&RateSample],
    scale: &Scale,
) -> std::fmt::Result {
    let display = if index == 0 { "inline" } else { "none" };
    writeln!(out, r#"<g class="series" id="series-{index}" style="display:{display}">"#)?;

    let coords: Vec<String> = points
        .iter()
        .map(|p| format!("{:.1},{:.1}", scale.x(p.count), scale.y(p.conversion_rate)))
        .collect();
    writeln!(
        out,
        r##"<polyline fill="none" stroke="#1f77b4" stroke-width="2" points="{}"/>"##,
        coords.join(" ")
    )?;

    for p in points {
        let x = scale.x(p.count);
        let y = scale.y(p.conversion_rate);
        writeln!(
            out,
            r##"<circle cx="{x:.1}" cy="{y:.1}" r="4" fill="#1f77b4"><title>n = {n}</title></circle><text x="{x:.1}" y="{ly:.1}" text-anchor="middle" font-size="11">{label}</text>"##,
            n = p.sample_size,
            ly = y - 9.0,
            label = point_label(p.conversion_rate),
        )?;
    }
    writeln!(out, "</g>")
}

/// Render the chart page for `features` (series order) from `samples`.
pub fn render_chart(samples: &[RateSample], features: &[String]) -> Result<String> {
    if features.is_empty() {
        anyhow::bail!("No features selected, nothing to chart");
    }

    let scale = Scale {
        max_count: samples.iter().map(|s| s.count).max().unwrap_or(0),
    };
    let titles: Vec<String> = features.iter().map(|f| chart_title(f)).collect();

    let mut body = String::new();
    render_axes(&mut body, &scale)?;
    for (index, feature) in features.iter().enumerate() {
        let points: Vec<&RateSample> = samples.iter().filter(|s| &s.feature == feature).collect();
        render_series(&mut body, index, &points, &scale)?;
    }

    let mut options = String::new();
    for (index, feature) in features.iter().enumerate() {
        writeln!(
            options,
            r#"<option value="{index}">{}</option>"#,
            escape_html(feature)
        )?;
    }

    let mut html = String::new();
    write!(
        html,
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{page_title}</title>
<style>
body {{ font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 24px; color: #222; }}
header {{ display: flex; align-items: center; gap: 24px; }}
h1 {{ font-size: 20px; margin: 0; }}
</style>
</head>
<body>
<header>
<h1 id="chart-title">{page_title}</h1>
<select id="feature-select" onchange="showSeries(this.value)">
{options}</select>
</header>
<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">
{body}</svg>
<script>
const titles = {titles_json};
function showSeries(selected) {{
  document.querySelectorAll("g.series").forEach(function (g, i) {{
    g.style.display = String(i) === String(selected) ? "inline" : "none";
  }});
  document.getElementById("chart-title").textContent = titles[selected];
}}
</script>
</body>
</html>
"#,
        page_title = escape_html(&titles[0]),
        width = WIDTH,
        height = HEIGHT,
        titles_json = serde_json::to_string(&titles)?.replace("</", "<\\/"),
    )?;
    Ok(html)
}

pub fn write_chart(file_path: &Path, samples: &[RateSample], features: &[String]) -> Result<()> {
    let html = render_chart(samples, features)?;
    fs::write(file_path, html).with_context(|| format!("Failed to write {:?}", file_path))?;
    info!(action = "write", component = "chart", file_path = ?file_path, series_count = features.len(), "Wrote conversion rate chart");
    Ok(())
}
