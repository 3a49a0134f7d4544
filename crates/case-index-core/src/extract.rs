//! Recursive HTML table extraction.
//!
//! Court case pages carry their data in loosely marked-up tables: section
//! dividers as `<th colspan>`, key/value cards with two cells per row,
//! registries with bold header cells, and tables nested inside cells. The
//! extractor flattens every `<table>` in a page into a [`TableVariant`] and
//! collects verdict texts from the tabbed verdict container.
//!
//! # Algorithm (per table)
//!
//! 1. Direct rows only: `tbody > tr` of a direct `tbody`, else direct `tr`.
//! 2. Drop section dividers (a `th` with `colspan`) and rows without `td`.
//! 3. First remaining row has exactly two `td` ⇒ [`TableVariant::Record`],
//!    otherwise [`TableVariant::RecordList`].
//! 4. Cells that contain a table are replaced by the recursive extraction
//!    of that table.
//!
//! # Example
//!
//! ```rust
//! use case_index_core::extract::TableExtractor;
//! use case_index_core::models::{CellValue, RawEntry, TableVariant};
//!
//! let html = "<table><tr><th colspan=2>ДЕЛО</th></tr>\
//!             <tr><td>Истец</td><td>Иванов</td></tr></table>";
//! let raw = TableExtractor::new().extract(html);
//! let RawEntry::Table(TableVariant::Record(card)) = &raw["ДЕЛО"] else { panic!() };
//! assert_eq!(card["Истец"], CellValue::Scalar("Иванов".into()));
//! ```
//!
//! Extraction never fails: malformed markup is handled by the HTML5 parser
//! and missing elements simply produce empty structures.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::empty::is_blank;
use crate::models::{CellValue, RawEntry, RawExtraction, Record, TableVariant};

/// Label for tables without a header cell in their first row.
pub const DEFAULT_TABLE_LABEL: &str = "Таблица";

/// Label for a verdict panel that has no tab title.
pub const DEFAULT_VERDICT_LABEL: &str = "Судебный акт";

struct Selectors {
    table: Selector,
    tr: Selector,
    th: Selector,
    verdict_container: Selector,
    verdict_tabs: Selector,
    verdict_panels: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            table: Selector::parse("table").expect("table selector"),
            tr: Selector::parse("tr").expect("tr selector"),
            th: Selector::parse("th").expect("th selector"),
            verdict_container: Selector::parse("#cont5").expect("verdict container selector"),
            verdict_tabs: Selector::parse("ul.tabs > li").expect("verdict tab selector"),
            verdict_panels: Selector::parse(".contentt > div[id^=cont_doc]")
                .expect("verdict panel selector"),
        }
    }
}

/// Reusable extractor holding pre-compiled selectors and the markup
/// repair pattern. Cheap to share across threads.
pub struct TableExtractor {
    selectors: Selectors,
    broken_row: Regex,
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TableExtractor {
    pub fn new() -> Self {
        Self {
            selectors: Selectors::new(),
            broken_row: Regex::new(r"(?i)</th>\s+<tr>\s+<tr>").expect("row repair pattern"),
        }
    }

    /// Extract every table and the verdict texts of one HTML page.
    pub fn extract(&self, html: &str) -> RawExtraction {
        let repaired = self.repair(html);
        let document = Html::parse_document(&repaired);

        let mut out = RawExtraction::new();
        for table in document.select(&self.selectors.table) {
            let label = self
                .table_label(table)
                .unwrap_or_else(|| DEFAULT_TABLE_LABEL.to_string());
            out.insert(label, RawEntry::Table(self.parse_table(table)));
        }

        // Verdicts go last so they win label collisions.
        for (label, text) in self.extract_verdicts(&document) {
            out.insert(label, RawEntry::Text(text));
        }
        out
    }

    /// Upstream pages sometimes close a header cell and open two rows in a
    /// row; collapse that into one properly nested row.
    fn repair<'a>(&self, html: &'a str) -> std::borrow::Cow<'a, str> {
        self.broken_row.replace_all(html, "</th></tr><tr>")
    }

    fn table_label(&self, table: ElementRef<'_>) -> Option<String> {
        let first_row = table.select(&self.selectors.tr).next()?;
        let th = first_row.select(&self.selectors.th).next()?;
        Some(collapsed_text(th))
    }

    /// Flatten one table into its variant.
    pub fn parse_table(&self, table: ElementRef<'_>) -> TableVariant {
        let data_rows: Vec<ElementRef<'_>> = table_rows(table)
            .into_iter()
            .filter(|tr| !is_section_divider(*tr) && !row_tds(*tr).is_empty())
            .collect();

        let Some(first) = data_rows.first() else {
            return TableVariant::empty();
        };

        if row_tds(*first).len() == 2 {
            TableVariant::Record(self.parse_card(&data_rows))
        } else {
            TableVariant::RecordList(self.parse_registry(&data_rows))
        }
    }

    fn parse_card(&self, rows: &[ElementRef<'_>]) -> Record {
        let mut record = Record::new();
        for tr in rows {
            let tds = row_tds(*tr);
            let [key_cell, value_cell] = tds.as_slice() else {
                continue;
            };
            let key = collapsed_text(*key_cell);
            if key.is_empty() {
                continue;
            }
            record.insert(key, self.cell_value(*value_cell));
        }
        record
    }

    fn parse_registry(&self, rows: &[ElementRef<'_>]) -> Vec<Record> {
        let (header_idx, headers) = rows
            .iter()
            .enumerate()
            .find_map(|(i, tr)| {
                let bolds = bold_headers(*tr);
                (bolds.len() >= 2).then_some((i, bolds))
            })
            .unwrap_or_else(|| {
                let headers = row_tds(rows[0]).into_iter().map(collapsed_text).collect();
                (0, headers)
            });

        let mut records = Vec::new();
        for tr in &rows[header_idx + 1..] {
            let tds = row_tds(*tr);
            let mut record = Record::new();
            for (label, cell) in headers.iter().zip(tds.iter()) {
                if is_blank(label) {
                    continue;
                }
                record.insert(label.clone(), self.cell_value(*cell));
            }
            if !record.is_empty() {
                records.push(record);
            }
        }
        records
    }

    fn cell_value(&self, cell: ElementRef<'_>) -> CellValue {
        match cell.select(&self.selectors.table).next() {
            Some(nested) => CellValue::Nested(Box::new(self.parse_table(nested))),
            None => CellValue::Scalar(collapsed_text(cell)),
        }
    }

    fn extract_verdicts(&self, document: &Html) -> Vec<(String, Option<String>)> {
        let Some(container) = document.select(&self.selectors.verdict_container).next() else {
            return Vec::new();
        };

        let tabs: Vec<_> = container.select(&self.selectors.verdict_tabs).collect();
        let panels: Vec<_> = container.select(&self.selectors.verdict_panels).collect();

        if !tabs.is_empty() && !panels.is_empty() {
            return tabs
                .iter()
                .zip(panels.iter())
                .map(|(tab, panel)| (collapsed_text(*tab), Some(collapsed_text(*panel))))
                .collect();
        }

        let text = panels.first().map(|panel| collapsed_text(*panel));
        vec![(DEFAULT_VERDICT_LABEL.to_string(), text)]
    }
}

/// Convenience wrapper for one-off extraction.
pub fn extract(html: &str) -> RawExtraction {
    TableExtractor::new().extract(html)
}

fn child_elements<'a>(el: ElementRef<'a>, name: &'a str) -> impl Iterator<Item = ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(move |child| child.value().name().eq_ignore_ascii_case(name))
}

/// Direct rows of a table; rows of nested tables are never included.
fn table_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let body_rows: Vec<_> = child_elements(table, "tbody")
        .flat_map(|tbody| child_elements(tbody, "tr"))
        .collect();
    if !body_rows.is_empty() {
        return body_rows;
    }
    child_elements(table, "tr").collect()
}

fn row_tds(tr: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    child_elements(tr, "td").collect()
}

fn is_section_divider(tr: ElementRef<'_>) -> bool {
    child_elements(tr, "th").any(|th| th.value().attr("colspan").is_some())
}

/// Texts of `<b>` elements sitting directly inside the row's cells.
fn bold_headers(tr: ElementRef<'_>) -> Vec<String> {
    child_elements(tr, "td")
        .flat_map(|td| child_elements(td, "b"))
        .map(collapsed_text)
        .collect()
}

/// Descendant text with whitespace runs collapsed to one space, trimmed.
fn collapsed_text(el: ElementRef<'_>) -> String {
    let raw: String = el.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
