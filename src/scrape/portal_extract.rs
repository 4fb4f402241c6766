//! lk.rosreestr.ru 对象卡片的纯解析

use scraper::{ElementRef, Html, Selector};

use crate::core::PortalDetails;

const RIGHTS_SECTION_TITLE: &str = "Сведения о правах и ограничениях";

/// 卡片“权利与限制”区块里的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RightsEntry {
    pub name: String,
    pub values: Vec<String>,
}

fn squash(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 从卡片 HTML 中取出权利与限制区块的所有条目
pub fn parse_rights_html(html: &str) -> Vec<RightsEntry> {
    let document = Html::parse_document(html);
    let (Ok(section_sel), Ok(title_sel), Ok(item_sel), Ok(name_sel), Ok(value_sel)) = (
        Selector::parse(".build-card-wrapper__info"),
        Selector::parse("h3"),
        Selector::parse(".build-card-wrapper__info__ul__subinfo"),
        Selector::parse(".build-card-wrapper__info__ul__subinfo__name"),
        Selector::parse(".build-card-wrapper__info__ul__subinfo__options__item__line"),
    ) else {
        return Vec::new();
    };

    let Some(section) = document.select(&section_sel).find(|section| {
        section
            .select(&title_sel)
            .any(|h3| squash(h3).contains(RIGHTS_SECTION_TITLE))
    }) else {
        return Vec::new();
    };

    section
        .select(&item_sel)
        .filter_map(|item| {
            let name = item.select(&name_sel).next().map(squash)?;
            let values: Vec<String> = item
                .select(&value_sel)
                .map(squash)
                .filter(|v| !v.is_empty())
                .collect();
            (!name.is_empty() && !values.is_empty()).then_some(RightsEntry { name, values })
        })
        .collect()
}

/// 名称是否描述了一条登记的权利（“Вид, номер и дата государственной регистрации права” 等写法）
fn is_rights_entry(name_lower: &str) -> bool {
    if name_lower.contains("вид") {
        name_lower.contains("регистрац")
            || name_lower.contains("прав")
            || name_lower.contains("государствен")
            || (name_lower.contains("номер") && name_lower.contains("дата"))
    } else {
        (name_lower.contains("номер") && name_lower.contains("дата") && name_lower.contains("регистрац"))
            || (name_lower.contains("государствен") && name_lower.contains("регистрац"))
    }
}

fn is_encumbrance_entry(name_lower: &str) -> bool {
    name_lower.contains("обременение") || name_lower.contains("ограничение")
}

/// 归并为权利、限制两栏，同类多项用 “; ” 连接。所有者门户上不公开，不填
pub fn parse_rights_data(entries: &[RightsEntry]) -> PortalDetails {
    let mut rights = Vec::new();
    let mut encumbrances = Vec::new();

    for entry in entries {
        let name_lower = entry.name.to_lowercase();
        if is_encumbrance_entry(&name_lower) {
            encumbrances.extend(entry.values.iter().cloned());
        } else if is_rights_entry(&name_lower) {
            rights.extend(entry.values.iter().cloned());
        }
    }

    let join = |items: Vec<String>| (!items.is_empty()).then(|| items.join("; "));
    PortalDetails {
        rights: join(rights),
        encumbrances: join(encumbrances),
    }
}
