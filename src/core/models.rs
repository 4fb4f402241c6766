use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::types::PositionHint;

/// 一个地籍号在一次任务运行中汇总出的全部信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub cadastral_number: String,
    /// 对象类型：Земельный участок / Здание / Помещение / Сооружение
    pub object_type: Option<String>,
    pub address: Option<String>,
    pub area: Option<f64>,
    pub category: Option<String>,
    pub permitted_use: Option<String>,
    pub cadastral_value: Option<f64>,
    pub cadastral_cost_date: Option<String>,
    pub rights: Option<String>,
    pub owner: Option<String>,
    pub encumbrances: Option<String>,
    pub status: Option<String>,
    pub date_assigned: Option<String>,
    pub level: Option<String>,
    pub purpose: Option<String>,
    pub reg_date: Option<String>,
    pub info_update_date: Option<String>,
    pub old_cadastral_number: Option<String>,
    pub coordinates: Option<PositionHint>,
    pub map_image_path: Option<PathBuf>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub api_balance: Option<f64>,
}

impl EnrichedRecord {
    pub fn new(cadastral_number: impl Into<String>) -> Self {
        Self {
            cadastral_number: cadastral_number.into(),
            ..Default::default()
        }
    }

    /// 带错误码的失败记录
    pub fn failed(
        cadastral_number: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cadastral_number: cadastral_number.into(),
            error: Some(message.into()),
            error_code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_land_plot(&self) -> bool {
        self.object_type
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("земельный участок"))
    }

    pub fn has_detailed_rights(&self) -> bool {
        has_reference_detail(self.rights.as_deref())
    }

    pub fn has_detailed_encumbrances(&self) -> bool {
        has_reference_detail(self.encumbrances.as_deref())
    }

    /// 权利或限制缺少“编号+日期”细节，且本身不是错误记录时，需要到门户补全
    pub fn needs_portal_enrichment(&self) -> bool {
        !self.has_error() && (!self.has_detailed_rights() || !self.has_detailed_encumbrances())
    }

    /// 用门户抓到的数据覆盖接口数据，空值不覆盖
    pub fn apply_portal_details(&mut self, details: &PortalDetails) {
        if let Some(rights) = details.rights.as_ref().filter(|s| !s.is_empty()) {
            self.rights = Some(rights.clone());
        }
        if let Some(enc) = details.encumbrances.as_ref().filter(|s| !s.is_empty()) {
            self.encumbrances = Some(enc.clone());
        }
    }
}

/// 门户卡片中解析出的权利与限制
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalDetails {
    pub rights: Option<String>,
    pub encumbrances: Option<String>,
}

impl PortalDetails {
    pub fn is_empty(&self) -> bool {
        self.rights.is_none() && self.encumbrances.is_none()
    }
}

fn has_reference_detail(text: Option<&str>) -> bool {
    text.is_some_and(|t| t.contains('№') && t.contains("от"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_land_plot_detection_is_case_insensitive() {
        let mut record = EnrichedRecord::new("78:38:0022629:1115");
        record.object_type = Some("Земельный участок".to_string());
        assert!(record.is_land_plot());
        record.object_type = Some("Здание".to_string());
        assert!(!record.is_land_plot());
        record.object_type = None;
        assert!(!record.is_land_plot());
    }

    #[test]
    fn test_needs_portal_enrichment() {
        let mut record = EnrichedRecord::new("78:38:0022629:1115");
        record.rights = Some("Собственность".to_string());
        assert!(record.needs_portal_enrichment(), "没有编号和日期时需要补全");

        record.rights = Some("Собственность № 78-78/001-2020 от 01.02.2020".to_string());
        record.encumbrances = Some("Ипотека № 78-78/001-2021 от 03.04.2021".to_string());
        assert!(!record.needs_portal_enrichment(), "两项都有细节时不需要补全");

        let failed = EnrichedRecord::failed("78:38:0022629:1006", "NOT_FOUND", "не найден");
        assert!(!failed.needs_portal_enrichment(), "错误记录不做补全");
    }

    #[test]
    fn test_apply_portal_details_keeps_existing_on_empty() {
        let mut record = EnrichedRecord::new("78:38:0022629:1115");
        record.rights = Some("Собственность".to_string());
        record.apply_portal_details(&PortalDetails {
            rights: Some(String::new()),
            encumbrances: Some("Аренда № 1 от 02.03.2019".to_string()),
        });
        assert_eq!(record.rights.as_deref(), Some("Собственность"));
        assert_eq!(record.encumbrances.as_deref(), Some("Аренда № 1 от 02.03.2019"));
    }
}
