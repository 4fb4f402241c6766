use calamine::{Reader, open_workbook_auto};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::core::ExtractError;

/// 地籍号格式：XX:XX:XXXXXX…:X…（第三段至少 6 位，第四段 1–7 位）
static CADASTRAL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\d{2}:\d{2}:\d{6,}:\d{1,7}").ok());

static CADASTRAL_FULL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\d{2}:\d{2}:\d{6,}:\d{1,7}$").ok());

pub fn is_valid_cadastral_number(number: &str) -> bool {
    CADASTRAL_FULL_RE
        .as_ref()
        .is_some_and(|re| re.is_match(number.trim()))
}

/// 去掉空白后校验，不合法返回 None
pub fn normalize_cadastral_number(number: &str) -> Option<String> {
    let normalized: String = number.chars().filter(|c| !c.is_whitespace()).collect();
    is_valid_cadastral_number(&normalized).then_some(normalized)
}

fn collect_into(text: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    let Some(re) = CADASTRAL_RE.as_ref() else {
        return;
    };
    for found in re.find_iter(text) {
        if let Some(number) = normalize_cadastral_number(found.as_str()) {
            if seen.insert(number.clone()) {
                out.push(number);
            }
        }
    }
}

/// 从文本里提取地籍号，保持出现顺序并去重
pub fn extract_from_text(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut numbers = Vec::new();
    collect_into(text, &mut seen, &mut numbers);
    info!("从文本中提取到 {} 个地籍号", numbers.len());
    numbers
}

/// 扫描表格所有工作表的所有单元格
pub fn extract_from_spreadsheet(path: &Path) -> Result<Vec<String>, ExtractError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let numbers = match extension.as_str() {
        "xlsx" | "xls" | "xlsm" | "ods" => scan_workbook(path)?,
        "txt" | "csv" => extract_from_text(&std::fs::read_to_string(path)?),
        other => return Err(ExtractError::UnsupportedFile(other.to_string())),
    };

    if numbers.is_empty() {
        return Err(ExtractError::NoIdentifiers);
    }
    info!(
        "从文件 {} 中提取到 {} 个地籍号",
        path.display(),
        numbers.len()
    );
    Ok(numbers)
}

fn scan_workbook(path: &Path) -> Result<Vec<String>, ExtractError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| ExtractError::Spreadsheet(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut numbers = Vec::new();
    for sheet in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&sheet) {
            Ok(range) => range,
            Err(e) => {
                debug!("跳过工作表 {}: {}", sheet, e);
                continue;
            }
        };
        let before = numbers.len();
        for row in range.rows() {
            for cell in row {
                collect_into(&cell.to_string(), &mut seen, &mut numbers);
            }
        }
        debug!("工作表 {} 新增 {} 个地籍号", sheet, numbers.len() - before);
    }
    Ok(numbers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_preserves_order_and_dedups() {
        let numbers = extract_from_text("78:38:0022629:1115, 78:38:0022629:1006");
        assert_eq!(numbers, vec!["78:38:0022629:1115", "78:38:0022629:1006"]);

        let numbers = extract_from_text(
            "78:38:0022629:1006\n78:38:0022629:1115; 78:38:0022629:1006 и ещё 22:61:020713:45",
        );
        assert_eq!(
            numbers,
            vec!["78:38:0022629:1006", "78:38:0022629:1115", "22:61:020713:45"]
        );
    }

    #[test]
    fn test_extract_rejects_short_segments() {
        assert!(extract_from_text("78:38:00226:1115 hello").is_empty(), "第三段不足 6 位");
        assert!(extract_from_text("").is_empty());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_cadastral_number(" 78:38:0022629:1115 "),
            Some("78:38:0022629:1115".to_string())
        );
        assert_eq!(normalize_cadastral_number("invalid"), None);
    }

    #[test]
    fn test_text_file_and_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("numbers.txt");
        std::fs::write(&txt, "47:14:1203001:814\n47:14:1203001:814").unwrap();
        assert_eq!(extract_from_spreadsheet(&txt).unwrap(), vec!["47:14:1203001:814"]);

        let empty = dir.path().join("empty.csv");
        std::fs::write(&empty, "nothing here").unwrap();
        assert!(matches!(
            extract_from_spreadsheet(&empty),
            Err(ExtractError::NoIdentifiers)
        ));

        let pdf = dir.path().join("scan.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();
        assert!(matches!(
            extract_from_spreadsheet(&pdf),
            Err(ExtractError::UnsupportedFile(_))
        ));
    }

    #[test]
    fn test_xlsx_round_trip_through_report_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.xlsx");
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Кадастровый номер").unwrap();
        sheet.write_string(1, 0, "78:38:0022629:1115").unwrap();
        sheet.write_string(2, 3, "см. 78:38:0022629:1006").unwrap();
        workbook.save(&path).unwrap();

        assert_eq!(
            extract_from_spreadsheet(&path).unwrap(),
            vec!["78:38:0022629:1115", "78:38:0022629:1006"]
        );
    }
}
