//! Excelレポートシンク
//!
//! セッションサマリーとトップスペンダーを1冊のワークブックに書き出す。
//! xlsxは追記編集できないため、行データはJSONサイドカーに保持し、
//! 書き込みのたびにワークブックを再構築する。session_idが同じ行は
//! 置き換えられるので、再投入が重複行を作らない。

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook, Worksheet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::SummarySink;
use crate::session::{SessionSummary, TopSpender, TOP_SPENDER_LIMIT};

const SHEET_SUMMARY: &str = "Live Summary";
const SHEET_TOP: &str = "Top Spender";

/// トップスペンダーシートの1行
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopRow {
    session_id: String,
    account: String,
    date: NaiveDate,
    spenders: Vec<TopSpender>,
}

/// サイドカーに永続化する行データ
#[derive(Debug, Default, Serialize, Deserialize)]
struct ReportRows {
    summaries: Vec<SessionSummary>,
    top_rows: Vec<TopRow>,
}

/// Excelワークブックシンク
pub struct WorkbookSink {
    report_path: PathBuf,
    rows_path: PathBuf,
    rows: Mutex<ReportRows>,
}

impl WorkbookSink {
    /// レポートパスからシンクを作成（サイドカーがあれば読み戻す）
    pub fn new(report_path: impl AsRef<Path>) -> Self {
        let report_path = report_path.as_ref().to_path_buf();
        let rows_path = report_path.with_extension("rows.json");

        let rows = match fs::read_to_string(&rows_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("レポート行データ破損のため空で開始します: {}", e);
                    ReportRows::default()
                }
            },
            Err(_) => ReportRows::default(),
        };

        Self {
            report_path,
            rows_path,
            rows: Mutex::new(rows),
        }
    }

    /// 行データをサイドカーへ書き、ワークブックを再構築する
    fn persist(&self, rows: &ReportRows) -> Result<()> {
        let json = serde_json::to_string_pretty(rows)
            .context("Failed to serialize report rows")?;
        fs::write(&self.rows_path, json)
            .with_context(|| format!("Failed to write {}", self.rows_path.display()))?;

        self.rebuild_workbook(rows)
    }

    /// 行データからワークブック全体を書き出す
    fn rebuild_workbook(&self, rows: &ReportRows) -> Result<()> {
        let mut workbook = Workbook::new();

        let header_format = Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0x4472C4))
            .set_font_color(Color::White)
            .set_border(FormatBorder::Thin);

        self.write_summary_sheet(&mut workbook, rows, &header_format)?;
        self.write_top_sheet(&mut workbook, rows, &header_format)?;

        workbook
            .save(&self.report_path)
            .with_context(|| format!("Failed to save {}", self.report_path.display()))?;

        Ok(())
    }

    fn write_summary_sheet(
        &self,
        workbook: &mut Workbook,
        rows: &ReportRows,
        header_format: &Format,
    ) -> Result<()> {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(SHEET_SUMMARY)?;

        let headers = [
            "Date",
            "Start",
            "End",
            "Duration",
            "Account",
            "Total Diamond",
            "Peak Viewer",
        ];
        for (col, header) in headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, header_format)?;
        }

        for (row, summary) in rows.summaries.iter().enumerate() {
            let row_idx = (row + 1) as u32;
            worksheet.write_string(row_idx, 0, &format_date(summary.date))?;
            worksheet.write_string(row_idx, 1, &summary.start_time)?;
            worksheet.write_string(row_idx, 2, &summary.end_time)?;
            worksheet.write_string(row_idx, 3, &summary.duration_label())?;
            worksheet.write_string(row_idx, 4, &summary.account)?;
            worksheet.write_number(row_idx, 5, summary.total_diamond as f64)?;
            worksheet.write_number(row_idx, 6, summary.peak_viewers as f64)?;
        }

        Ok(())
    }

    fn write_top_sheet(
        &self,
        workbook: &mut Workbook,
        rows: &ReportRows,
        header_format: &Format,
    ) -> Result<()> {
        let worksheet: &mut Worksheet = workbook.add_worksheet();
        worksheet.set_name(SHEET_TOP)?;

        worksheet.write_string_with_format(0, 0, "Date", header_format)?;
        worksheet.write_string_with_format(0, 1, "Account", header_format)?;
        for i in 0..TOP_SPENDER_LIMIT {
            worksheet.write_string_with_format(
                0,
                (i + 2) as u16,
                &format!("Top{}", i + 1),
                header_format,
            )?;
        }

        for (row, top_row) in rows.top_rows.iter().enumerate() {
            let row_idx = (row + 1) as u32;
            worksheet.write_string(row_idx, 0, &format_date(top_row.date))?;
            worksheet.write_string(row_idx, 1, &top_row.account)?;
            for i in 0..TOP_SPENDER_LIMIT {
                let cell = match top_row.spenders.get(i) {
                    Some(s) => format!("{} ({})", s.display_name, s.points),
                    None => "-".to_string(),
                };
                worksheet.write_string(row_idx, (i + 2) as u16, &cell)?;
            }
        }

        Ok(())
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl SummarySink for WorkbookSink {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn record_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        let mut rows = self.rows.lock();

        // 同一session_idの行は置き換え
        if let Some(existing) = rows
            .summaries
            .iter_mut()
            .find(|s| s.session_id == summary.session_id)
        {
            *existing = summary.clone();
        } else {
            rows.summaries.push(summary.clone());
        }

        self.persist(&rows)
    }

    fn record_top_spenders(
        &self,
        summary: &SessionSummary,
        spenders: &[TopSpender],
    ) -> Result<()> {
        let mut rows = self.rows.lock();

        let new_row = TopRow {
            session_id: summary.session_id.clone(),
            account: summary.account.clone(),
            date: summary.date,
            spenders: spenders.to_vec(),
        };

        if let Some(existing) = rows
            .top_rows
            .iter_mut()
            .find(|r| r.session_id == summary.session_id)
        {
            *existing = new_row;
        } else {
            rows.top_rows.push(new_row);
        }

        self.persist(&rows)
    }
}
