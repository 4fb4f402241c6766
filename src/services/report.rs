use chrono::Local;
use rust_xlsxwriter::{Color, Format, FormatAlign, Image, Workbook, Worksheet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::{EnrichedRecord, ReportError};
use crate::utils::text::{format_area, format_money};

const SHEET_NAME: &str = "Данные из Росреестра";
const MAP_HEADER: &str = "Карта";
const ERROR_HEADER: &str = "Ошибка";
const NO_ENCUMBRANCES: &str = "Отсутствуют";

/// 列标题与宽度，顺序即表格列顺序
const COLUMNS: &[(&str, f64)] = &[
    ("№", 6.0),
    ("Наименование", 20.0),
    ("Кадастровый номер", 22.0),
    ("Адрес (местоположение)", 60.0),
    ("Общая площадь, кв. м", 18.0),
    ("Категория", 25.0),
    ("Разрешенное использование", 25.0),
    ("Кадастровая стоимость", 22.0),
    ("Передаваемые права", 30.0),
    ("Правообладатель (собственник)", 30.0),
    ("Обременения (ограничения)", 30.0),
    ("Этаж", 10.0),
    ("Статус объекта", 15.0),
    ("Назначение", 20.0),
    ("Дата регистрации права", 18.0),
    ("Дата обновления информации", 18.0),
    ("Старый кадастровый номер", 22.0),
    ("Дата кадастровой стоимости", 18.0),
    (MAP_HEADER, 30.0),
    (ERROR_HEADER, 40.0),
];

const MAP_ROW_HEIGHT: f64 = 150.0;

/// 报告生成：记录列表 → 输出文件路径
pub trait ReportAssembler: Send + Sync {
    fn assemble(
        &self,
        records: &[EnrichedRecord],
        source_file: Option<&Path>,
    ) -> Result<PathBuf, ReportError>;
}

pub struct XlsxReportAssembler {
    output_dir: PathBuf,
}

impl XlsxReportAssembler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn output_path(&self, source_file: Option<&Path>) -> PathBuf {
        let timestamp = Local::now().format("%d.%m.%Y_%H-%M-%S");
        let file_name = match source_file.and_then(|p| p.file_stem()) {
            Some(stem) => format!("{}_результат_{}.xlsx", stem.to_string_lossy(), timestamp),
            None => format!("росреестр_данные_{}.xlsx", timestamp),
        };
        self.output_dir.join(file_name)
    }
}

/// 一行的文本单元格，顺序与 COLUMNS 前 18 列一致
pub fn record_cells(index: usize, record: &EnrichedRecord) -> Vec<String> {
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    vec![
        index.to_string(),
        text(&record.object_type),
        record.cadastral_number.clone(),
        text(&record.address),
        record.area.map(format_area).unwrap_or_default(),
        text(&record.category),
        text(&record.permitted_use),
        record.cadastral_value.map(format_money).unwrap_or_default(),
        text(&record.rights),
        text(&record.owner),
        record
            .encumbrances
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| NO_ENCUMBRANCES.to_string()),
        text(&record.level),
        text(&record.status),
        text(&record.purpose),
        text(&record.reg_date),
        text(&record.info_update_date),
        text(&record.old_cadastral_number),
        text(&record.cadastral_cost_date),
    ]
}

fn write_map(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    record: &EnrichedRecord,
) -> Result<bool, ReportError> {
    let Some(path) = record.map_image_path.as_ref() else {
        return Ok(false);
    };
    if !record.is_land_plot() || !path.exists() {
        return Ok(false);
    }
    match Image::new(path) {
        Ok(image) => {
            sheet.set_row_height(row, MAP_ROW_HEIGHT)?;
            sheet.insert_image_fit_to_cell(row, col, &image, true)?;
            Ok(true)
        }
        Err(e) => {
            // 图片坏了只丢图，不影响整份报告
            warn!("无法插入地图 {}: {}", path.display(), e);
            Ok(false)
        }
    }
}

impl ReportAssembler for XlsxReportAssembler {
    fn assemble(
        &self,
        records: &[EnrichedRecord],
        source_file: Option<&Path>,
    ) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(&self.output_dir)?;

        let header_format = Format::new()
            .set_bold()
            .set_align(FormatAlign::Center)
            .set_align(FormatAlign::VerticalCenter)
            .set_text_wrap()
            .set_background_color(Color::RGB(0xE7E6E6));
        let error_format = Format::new()
            .set_text_wrap()
            .set_background_color(Color::RGB(0xFFE6E6));
        let cell_format = Format::new()
            .set_text_wrap()
            .set_align(FormatAlign::VerticalCenter);

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(SHEET_NAME)?;

        for (col, (header, width)) in COLUMNS.iter().enumerate() {
            let col = col as u16;
            sheet.write_string_with_format(0, col, *header, &header_format)?;
            sheet.set_column_width(col, *width)?;
        }

        let map_col = (COLUMNS.len() - 2) as u16;
        let error_col = (COLUMNS.len() - 1) as u16;
        let mut maps_inserted = 0;

        for (idx, record) in records.iter().enumerate() {
            let row = (idx + 1) as u32;
            let format = if record.has_error() {
                &error_format
            } else {
                &cell_format
            };
            for (col, value) in record_cells(idx + 1, record).iter().enumerate() {
                sheet.write_string_with_format(row, col as u16, value, format)?;
            }
            if let Some(error) = record.error.as_deref() {
                sheet.write_string_with_format(row, error_col, error, format)?;
            }
            if write_map(sheet, row, map_col, record)? {
                maps_inserted += 1;
            }
        }

        let path = self.output_path(source_file);
        workbook.save(&path)?;
        info!(
            "✓ 报告已生成: {} ({} 行, {} 张地图)",
            path.display(),
            records.len(),
            maps_inserted
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{Reader, open_workbook_auto};

    fn sample_record() -> EnrichedRecord {
        let mut record = EnrichedRecord::new("78:38:0022629:1115");
        record.object_type = Some("Земельный участок".to_string());
        record.area = Some(2956.0);
        record.cadastral_value = Some(24224607.11);
        record
    }

    #[test]
    fn test_record_cells_defaults() {
        let cells = record_cells(1, &sample_record());
        assert_eq!(cells.len(), COLUMNS.len() - 2);
        assert_eq!(cells[0], "1");
        assert_eq!(cells[4], "2956");
        assert_eq!(cells[7], "24224607,11");
        assert_eq!(cells[10], NO_ENCUMBRANCES, "没有限制时写 Отсутствуют");
    }

    #[test]
    fn test_assemble_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = XlsxReportAssembler::new(dir.path().join("out"));
        let records = vec![
            sample_record(),
            EnrichedRecord::failed("78:38:0022629:1006", "NOT_FOUND", "Объект не найден"),
        ];

        let path = assembler
            .assemble(&records, Some(Path::new("/tmp/входные.xlsx")))
            .unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("входные_результат_"), "文件名: {}", name);

        let mut workbook = open_workbook_auto(&path).unwrap();
        let range = workbook.worksheet_range(SHEET_NAME).unwrap();
        assert_eq!(range.height(), 3);
        assert_eq!(range.get((1, 2)).unwrap().to_string(), "78:38:0022629:1115");
        assert_eq!(
            range.get((2, COLUMNS.len() - 1)).unwrap().to_string(),
            "Объект не найден"
        );
    }

    #[test]
    fn test_missing_map_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = XlsxReportAssembler::new(dir.path());
        let mut record = sample_record();
        record.map_image_path = Some(dir.path().join("missing_map.png"));
        assert!(assembler.assemble(&[record], None).is_ok());
    }
}
