//! nspd.gov.ru 页面快照的纯解析，不依赖浏览器

use scraper::{ElementRef, Html, Selector};
use std::path::{Path, PathBuf};

use crate::app::config::CropBorder;
use crate::core::EnrichedRecord;

pub fn map_file_path(maps_dir: &Path, identifier: &str) -> PathBuf {
    maps_dir.join(format!("{}_map.png", identifier.replace(':', "_")))
}

/// 在结果按钮里找目标地块：先找“Земельный участок: 号”，再找只含号码的按钮
pub fn pick_result_button(texts: &[String], identifier: &str) -> Option<usize> {
    let full = format!("Земельный участок: {}", identifier);
    texts
        .iter()
        .position(|t| t.contains(&full))
        .or_else(|| texts.iter().position(|t| t.contains(identifier)))
}

/// 截图裁剪区域 (x, y, width, height)。边框比视口还大时返回 None，保留整图
pub fn crop_clip(width: u32, height: u32, crop: &CropBorder) -> Option<(f64, f64, f64, f64)> {
    let clip_width = width.checked_sub(crop.left + crop.right)?;
    let clip_height = height.checked_sub(crop.top + crop.bottom)?;
    if clip_width == 0 || clip_height == 0 {
        return None;
    }
    Some((
        crop.left as f64,
        crop.top as f64,
        clip_width as f64,
        clip_height as f64,
    ))
}

fn attr_or_text(el: ElementRef<'_>) -> Option<String> {
    let text = el
        .value()
        .attr("text")
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| el.text().collect::<String>());
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// 信息面板里的“标签 → 值”，保持页面顺序
pub fn parse_info_panel(html: &str) -> Vec<(String, String)> {
    let document = Html::parse_fragment(html);
    let (Ok(container_sel), Ok(label_sel), Ok(value_sel)) = (
        Selector::parse(".info-container"),
        Selector::parse("m-typography"),
        Selector::parse("m-string-item"),
    ) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for container in document.select(&container_sel) {
        let mut labels = container.select(&label_sel);
        let Some(label) = labels.next().and_then(attr_or_text) else {
            continue;
        };
        let value = container
            .select(&value_sel)
            .next()
            .and_then(attr_or_text)
            .or_else(|| labels.next().and_then(attr_or_text));
        if let Some(value) = value.filter(|v| *v != label) {
            entries.push((label, value));
        }
    }
    entries
}

const NO_GEOMETRY_MARKERS: &[&str] = &[
    "без координат границ",
    "координаты границ отсутствуют",
    "граница не установлена",
    "границы не установлены",
];

/// 信息面板声明对象没有边界坐标，地图上无从定位
pub fn lacks_geometry(html: &str) -> bool {
    parse_info_panel(html).iter().any(|(label, value)| {
        let text = format!("{} {}", label, value).to_lowercase();
        NO_GEOMETRY_MARKERS.iter().any(|marker| text.contains(marker))
            || (text.contains("границ") && text.contains("не установлен"))
    })
}

/// 按候选标签依次取值，“-” 视为空
fn field(entries: &[(String, String)], variants: &[&str]) -> Option<String> {
    variants.iter().find_map(|variant| {
        entries
            .iter()
            .find(|(label, _)| label == variant)
            .map(|(_, value)| value.trim().to_string())
            .filter(|v| !v.is_empty() && v != "-")
    })
}

fn parse_number(raw: &str, units: &[&str]) -> Option<f64> {
    let mut cleaned = raw.to_string();
    for unit in units {
        cleaned = cleaned.replace(unit, "");
    }
    cleaned
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace(',', ".")
        .parse()
        .ok()
}

/// 把信息面板转换成记录，一个字段都没解析到时返回 None
pub fn parse_map_record(identifier: &str, html: &str) -> Option<EnrichedRecord> {
    let entries = parse_info_panel(html);
    if entries.is_empty() {
        return None;
    }

    let mut record = EnrichedRecord::new(identifier);
    record.object_type = field(&entries, &["Вид объекта недвижимости", "Вид объекта"]);
    record.area = field(
        &entries,
        &["Площадь уточненная", "Площадь", "Площадь декларированная"],
    )
    .and_then(|v| parse_number(&v, &["кв. м", "кв.м"]));
    record.address = field(&entries, &["Адрес"]);
    record.category = field(&entries, &["Категория земель", "Категория"]);
    record.permitted_use = field(
        &entries,
        &["Вид разрешенного использования", "Разрешенное использование"],
    );
    record.cadastral_value =
        field(&entries, &["Кадастровая стоимость"]).and_then(|v| parse_number(&v, &["руб.", "руб"]));
    record.status = field(&entries, &["Статус"]);
    record.date_assigned = field(&entries, &["Дата присвоения"]);
    record.rights = field(&entries, &["Форма собственности"]);
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PANEL: &str = r#"
        <div id="tabpanel-info" role="tabpanel">
            <div class="info-container">
                <m-typography text="Вид объекта недвижимости"></m-typography>
                <m-string-item text="Земельный участок"></m-string-item>
            </div>
            <div class="info-container">
                <m-typography text="Площадь уточненная"></m-typography>
                <m-string-item text="2 956,5 кв. м"></m-string-item>
            </div>
            <div class="info-container">
                <m-typography>Адрес</m-typography>
                <m-typography>г. Санкт-Петербург, ул. Тестовая, д. 1</m-typography>
            </div>
            <div class="info-container">
                <m-typography text="Кадастровая стоимость"></m-typography>
                <m-string-item text="24 224 607,11 руб."></m-string-item>
            </div>
            <div class="info-container">
                <m-typography text="Статус"></m-typography>
                <m-string-item text="-"></m-string-item>
            </div>
            <div class="info-container">
                <m-typography text="Форма собственности"></m-typography>
                <m-string-item text="Частная"></m-string-item>
            </div>
        </div>
    "#;

    #[test]
    fn test_parse_map_record() {
        let record = parse_map_record("78:38:0022629:1115", PANEL).unwrap();
        assert!(record.is_land_plot());
        assert_eq!(record.area, Some(2956.5));
        assert_eq!(
            record.address.as_deref(),
            Some("г. Санкт-Петербург, ул. Тестовая, д. 1")
        );
        assert_eq!(record.cadastral_value, Some(24224607.11));
        assert_eq!(record.status, None, "“-” 视为空");
        assert_eq!(record.rights.as_deref(), Some("Частная"));
    }

    #[test]
    fn test_lacks_geometry() {
        assert!(!lacks_geometry(PANEL), "正常面板有边界");
        let no_boundary = r#"
            <div class="info-container">
                <m-typography text="Особые отметки"></m-typography>
                <m-string-item text="Граница земельного участка не установлена; Без координат границ"></m-string-item>
            </div>
        "#;
        assert!(lacks_geometry(no_boundary));
        let unset_only = no_boundary.replace("; Без координат границ", "");
        assert!(lacks_geometry(&unset_only), "只声明边界未确定也算");
        assert!(!lacks_geometry("<div></div>"));
    }

    #[test]
    fn test_empty_panel() {
        assert!(parse_map_record("78:38:0022629:1115", "<div></div>").is_none());
    }

    #[test]
    fn test_pick_result_button() {
        let texts = vec![
            "Здание: 78:38:0022629:2001".to_string(),
            "78:38:0022629:1115".to_string(),
            "Земельный участок: 78:38:0022629:1115".to_string(),
        ];
        assert_eq!(pick_result_button(&texts, "78:38:0022629:1115"), Some(2));
        assert_eq!(pick_result_button(&texts[..2], "78:38:0022629:1115"), Some(1));
        assert_eq!(pick_result_button(&texts, "78:38:0022629:9999"), None);
    }

    #[test]
    fn test_crop_clip() {
        let crop = CropBorder {
            left: 550,
            top: 120,
            right: 150,
            bottom: 180,
        };
        assert_eq!(crop_clip(1920, 1080, &crop), Some((550.0, 120.0, 1220.0, 780.0)));
        assert_eq!(crop_clip(600, 200, &crop), None);
    }

    #[test]
    fn test_map_file_path() {
        assert_eq!(
            map_file_path(Path::new("maps"), "78:38:0022629:1115"),
            PathBuf::from("maps/78_38_0022629_1115_map.png")
        );
    }
}
