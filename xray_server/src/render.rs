use xray_prediction::PredictionResult;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const REPORT_TEMPLATE: &str = include_str!("../templates/report.html");
const ERROR_TEMPLATE: &str = include_str!("../templates/error.html");

pub struct ReportView<'a> {
    pub project_name: &'a str,
    pub image_url: &'a str,
    pub result: &'a PredictionResult,
}

pub fn render_index(project_name: &str, action: &str) -> String {
    INDEX_TEMPLATE
        .replace("{{ project_name }}", &escape_html(project_name))
        .replace("{{ action }}", &escape_html(action))
}

pub fn render_report(view: &ReportView<'_>) -> String {
    let rows: String = view
        .result
        .probabilities
        .iter()
        .map(|(label, p)| {
            let class = if label == view.result.predicted_label {
                " class=\"predicted\""
            } else {
                ""
            };
            format!(
                "    <tr{}><td>{}</td><td>{:.2}</td></tr>\n",
                class,
                escape_html(label),
                as_percentage(p)
            )
        })
        .collect();

    REPORT_TEMPLATE
        .replace("{{ project_name }}", &escape_html(view.project_name))
        .replace("{{ image_url }}", &escape_html(view.image_url))
        .replace("{{ pred }}", &escape_html(&view.result.predicted_label))
        .replace("{{ rows }}\n", &rows)
        .replace("{{ home }}", "/")
}

pub fn render_error(project_name: &str, message: &str) -> String {
    ERROR_TEMPLATE
        .replace("{{ project_name }}", &escape_html(project_name))
        .replace("{{ message }}", &escape_html(message))
        .replace("{{ home }}", "/")
}

/// Probability in [0, 1] as a percentage rounded to two decimals.
pub fn as_percentage(p: f32) -> f64 {
    (p as f64 * 100.0 * 100.0).round() / 100.0
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}
