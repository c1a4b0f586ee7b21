//! Standalone HTML documents meant to be opened in a window and printed.

use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolHeader {
    pub name: String,
    pub address: String,
    pub motto: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardRow {
    pub subject: String,
    pub test1: f64,
    pub test2: f64,
    pub exam: f64,
    pub total: f64,
    pub percentage: f64,
    pub grade: String,
    pub remark: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub school: SchoolHeader,
    pub student_name: String,
    pub admission_no: String,
    pub class_name: String,
    pub term: String,
    pub session: String,
    pub rows: Vec<ReportCardRow>,
    pub average: Option<f64>,
    pub overall_grade: Option<String>,
    pub position: Option<String>,
    pub class_size: usize,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub school: SchoolHeader,
    pub receipt_no: String,
    pub student_name: String,
    pub admission_no: String,
    pub class_name: String,
    pub term: String,
    pub session: String,
    pub amount: f64,
    pub method: String,
    pub reference: Option<String>,
    pub status: String,
    pub paid_at: String,
    pub balance_after: f64,
    pub fee_status: String,
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn format_money(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let negative = cents < 0;
    let cents = cents.abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!(
        "{}{}.{:02}",
        if negative { "-" } else { "" },
        grouped,
        cents % 100
    )
}

fn fmt_score(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{:.0}", v)
    } else {
        format!("{:.1}", v)
    }
}

const STYLE: &str = "body{font-family:Georgia,serif;margin:24px;color:#222}\
h1{margin:0;font-size:22px}.muted{color:#666;font-size:12px}\
table{border-collapse:collapse;width:100%;margin-top:16px}\
th,td{border:1px solid #999;padding:6px;text-align:left}\
.summary td{font-weight:bold}";

fn write_header(out: &mut String, school: &SchoolHeader, title: &str) {
    let _ = write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title><style>{}</style></head><body>",
        escape_html(title),
        STYLE
    );
    let _ = write!(out, "<header><h1>{}</h1>", escape_html(&school.name));
    if !school.address.is_empty() {
        let _ = write!(out, "<div class=\"muted\">{}</div>", escape_html(&school.address));
    }
    if !school.motto.is_empty() {
        let _ = write!(out, "<div class=\"muted\"><em>{}</em></div>", escape_html(&school.motto));
    }
    let _ = write!(out, "<h2>{}</h2></header>", escape_html(title));
}

pub fn render_report_card(card: &ReportCard) -> String {
    let mut out = String::new();
    write_header(&mut out, &card.school, "Student Report Card");

    let _ = write!(
        out,
        "<p><strong>Name:</strong> {} &nbsp; <strong>Admission No:</strong> {}<br>\
         <strong>Class:</strong> {} &nbsp; <strong>Term:</strong> {} &nbsp; <strong>Session:</strong> {}</p>",
        escape_html(&card.student_name),
        escape_html(&card.admission_no),
        escape_html(&card.class_name),
        escape_html(&card.term),
        escape_html(&card.session),
    );

    out.push_str(
        "<table><thead><tr><th>Subject</th><th>Test 1</th><th>Test 2</th><th>Exam</th>\
         <th>Total</th><th>%</th><th>Grade</th><th>Remark</th></tr></thead><tbody>",
    );
    if card.rows.is_empty() {
        out.push_str("<tr><td colspan=\"8\">No approved results for this term.</td></tr>");
    }
    for row in &card.rows {
        let _ = write!(
            out,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.1}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&row.subject),
            fmt_score(row.test1),
            fmt_score(row.test2),
            fmt_score(row.exam),
            fmt_score(row.total),
            row.percentage,
            escape_html(&row.grade),
            escape_html(&row.remark),
        );
    }
    out.push_str("</tbody></table>");

    out.push_str("<table class=\"summary\"><tbody>");
    if let Some(avg) = card.average {
        let _ = write!(out, "<tr><td>Average</td><td>{:.1}%</td></tr>", avg);
    }
    if let Some(grade) = &card.overall_grade {
        let _ = write!(out, "<tr><td>Overall Grade</td><td>{}</td></tr>", escape_html(grade));
    }
    if let Some(position) = &card.position {
        let _ = write!(
            out,
            "<tr><td>Position</td><td>{} of {}</td></tr>",
            escape_html(position),
            card.class_size
        );
    }
    out.push_str("</tbody></table>");

    let _ = write!(
        out,
        "<p class=\"muted\">Generated {}</p></body></html>",
        escape_html(&card.generated_at)
    );
    out
}

pub fn render_receipt(receipt: &Receipt) -> String {
    let mut out = String::new();
    write_header(&mut out, &receipt.school, "Payment Receipt");

    out.push_str("<table><tbody>");
    let mut row = |label: &str, value: String| {
        let _ = write!(
            out,
            "<tr><th>{}</th><td>{}</td></tr>",
            escape_html(label),
            escape_html(&value)
        );
    };
    row("Receipt No", receipt.receipt_no.clone());
    row("Student", receipt.student_name.clone());
    row("Admission No", receipt.admission_no.clone());
    row("Class", receipt.class_name.clone());
    row("Term", format!("{} ({})", receipt.term, receipt.session));
    row("Amount", format_money(receipt.amount));
    row("Method", receipt.method.clone());
    if let Some(reference) = &receipt.reference {
        row("Reference", reference.clone());
    }
    row("Status", receipt.status.clone());
    row("Date", receipt.paid_at.clone());
    row("Outstanding Balance", format_money(receipt.balance_after));
    row("Fee Status", receipt.fee_status.clone());
    out.push_str("</tbody></table></body></html>");
    out
}
