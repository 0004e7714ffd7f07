use anyhow::anyhow;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference};
use serde::Serialize;
use std::io::BufWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Pdf,
    Html,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
        }
    }
}

/// Format-independent report content: one heading block and one table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub school_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_html(doc: &ReportDocument) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", escape_html(&doc.title)));
    html.push_str(
        "<style>body{font-family:Helvetica,Arial,sans-serif;margin:24px}\
         table{border-collapse:collapse;width:100%}\
         th,td{border:1px solid #999;padding:4px 8px;text-align:left}\
         th{background:#eee}</style>\n",
    );
    html.push_str("</head>\n<body>\n");
    if let Some(school) = &doc.school_name {
        html.push_str(&format!("<h2>{}</h2>\n", escape_html(school)));
    }
    html.push_str(&format!("<h1>{}</h1>\n", escape_html(&doc.title)));
    if let Some(ts) = &doc.generated_at {
        html.push_str(&format!("<p>Generated: {}</p>\n", escape_html(ts)));
    }
    html.push_str("<table>\n<thead><tr>");
    for c in &doc.columns {
        html.push_str(&format!("<th>{}</th>", escape_html(c)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    if doc.rows.is_empty() {
        html.push_str(&format!(
            "<tr><td colspan=\"{}\">No data</td></tr>\n",
            doc.columns.len().max(1)
        ));
    }
    for row in &doc.rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n</body>\n</html>\n");
    html
}

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const MARGIN_LEFT: f32 = 15.0;
const MARGIN_TOP: f32 = 280.0;
const MARGIN_BOTTOM: f32 = 20.0;
const LINE_HEIGHT: f32 = 6.0;

struct PdfCursor<'a> {
    doc: &'a PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
    pages: usize,
}

impl PdfCursor<'_> {
    fn new_page(&mut self) {
        self.pages += 1;
        let (page, layer) = self.doc.add_page(
            Mm(PAGE_W),
            Mm(PAGE_H),
            format!("Layer {}", self.pages),
        );
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = MARGIN_TOP;
    }

    fn ensure_room(&mut self) -> bool {
        if self.y < MARGIN_BOTTOM {
            self.new_page();
            true
        } else {
            false
        }
    }
}

fn column_x(i: usize, count: usize) -> f32 {
    let usable = PAGE_W - 2.0 * MARGIN_LEFT;
    MARGIN_LEFT + usable * (i as f32) / (count.max(1) as f32)
}

/// Truncates a cell to what fits its column at 9pt Helvetica.
fn fit_cell(text: &str, count: usize) -> String {
    let usable = PAGE_W - 2.0 * MARGIN_LEFT;
    let max_chars = ((usable / count.max(1) as f32) / 1.9).floor().max(4.0) as usize;
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max_chars - 1).collect();
        s.push('~');
        s
    }
}

fn draw_header(cursor: &mut PdfCursor<'_>, columns: &[String], bold: &IndirectFontRef) {
    for (i, c) in columns.iter().enumerate() {
        cursor.layer.use_text(
            fit_cell(c, columns.len()),
            10.0,
            Mm(column_x(i, columns.len())),
            Mm(cursor.y),
            bold,
        );
    }
    cursor.y -= LINE_HEIGHT;
}

pub fn render_pdf(doc: &ReportDocument) -> anyhow::Result<Vec<u8>> {
    let (pdf, page1, layer1) = PdfDocument::new(doc.title.as_str(), Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
    let font = pdf
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| anyhow!("failed to load font: {e}"))?;
    let bold = pdf
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| anyhow!("failed to load font: {e}"))?;

    let mut cursor = PdfCursor {
        doc: &pdf,
        layer: pdf.get_page(page1).get_layer(layer1),
        y: MARGIN_TOP,
        pages: 1,
    };

    if let Some(school) = &doc.school_name {
        cursor
            .layer
            .use_text(school.as_str(), 12.0, Mm(MARGIN_LEFT), Mm(cursor.y), &font);
        cursor.y -= 7.0;
    }
    cursor
        .layer
        .use_text(doc.title.as_str(), 16.0, Mm(MARGIN_LEFT), Mm(cursor.y), &bold);
    cursor.y -= 8.0;
    if let Some(ts) = &doc.generated_at {
        cursor.layer.use_text(
            format!("Generated: {}", ts),
            9.0,
            Mm(MARGIN_LEFT),
            Mm(cursor.y),
            &font,
        );
        cursor.y -= 8.0;
    }
    cursor.y -= LINE_HEIGHT;

    draw_header(&mut cursor, &doc.columns, &bold);
    if doc.rows.is_empty() {
        cursor
            .layer
            .use_text("No data", 9.0, Mm(MARGIN_LEFT), Mm(cursor.y), &font);
    }
    for row in &doc.rows {
        if cursor.ensure_room() {
            draw_header(&mut cursor, &doc.columns, &bold);
        }
        for (i, cell) in row.iter().enumerate() {
            cursor.layer.use_text(
                fit_cell(cell, doc.columns.len()),
                9.0,
                Mm(column_x(i, doc.columns.len())),
                Mm(cursor.y),
                &font,
            );
        }
        cursor.y -= LINE_HEIGHT;
    }

    drop(cursor);
    let mut writer = BufWriter::new(Vec::new());
    pdf.save(&mut writer)
        .map_err(|e| anyhow!("failed to write pdf: {e}"))?;
    writer
        .into_inner()
        .map_err(|e| anyhow!("failed to flush pdf: {e}"))
}
