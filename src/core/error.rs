use chromiumoxide::error::CdpError;
use thiserror::Error;

/// 主数据源（api-cloud）错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("API 令牌未配置")]
    NotConfigured,

    #[error("API 不可用: {0}")]
    Unreachable(String),

    #[error("API 请求失败: {0}")]
    Http(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            SourceError::Unreachable(e.to_string())
        } else {
            SourceError::Http(e.to_string())
        }
    }
}

/// 地图失败原因分类，用于给用户的通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFailureKind {
    NotFound,
    MissingCoordinates,
    Timeout,
    Generic,
}

/// 地图抓取错误
#[derive(Debug, Error)]
pub enum MapError {
    #[error("地块 {0} 在地图上未找到")]
    PlotNotFound(String),

    #[error("地块 {0} 缺少坐标")]
    MissingCoordinates(String),

    #[error("地图加载超时: {0}")]
    Timeout(String),

    #[error("浏览器操作失败: {0}")]
    Browser(String),

    #[error("文件写入失败: {0}")]
    Io(#[from] std::io::Error),
}

impl MapError {
    pub fn failure_kind(&self) -> MapFailureKind {
        match self {
            MapError::PlotNotFound(_) => MapFailureKind::NotFound,
            MapError::MissingCoordinates(_) => MapFailureKind::MissingCoordinates,
            MapError::Timeout(_) => MapFailureKind::Timeout,
            _ => MapFailureKind::Generic,
        }
    }
}

impl From<CdpError> for MapError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Timeout => MapError::Timeout(e.to_string()),
            other => MapError::Browser(other.to_string()),
        }
    }
}

/// 门户（lk.rosreestr.ru）抓取错误，前两类只在验证码内层重试
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("验证码未能识别")]
    CaptchaUnrecognized,

    #[error("验证码被网站拒绝")]
    CaptchaRejected,

    #[error("未找到搜索按钮")]
    SearchButtonMissing,

    #[error("没有搜索结果")]
    NoResults,

    #[error("搜索结果中没有详情链接")]
    NoDetailLink,

    #[error("对象卡片未加载")]
    CardNotLoaded,

    #[error("页面导航失败: {0}")]
    Navigation(String),

    #[error("门户响应超时: {0}")]
    Timeout(String),

    #[error("浏览器操作失败: {0}")]
    Browser(String),
}

impl PortalError {
    pub fn is_captcha(&self) -> bool {
        matches!(self, PortalError::CaptchaUnrecognized | PortalError::CaptchaRejected)
    }

    /// 会话级错误需要重建子会话，而不是回到搜索页
    pub fn needs_restart(&self) -> bool {
        match self {
            PortalError::Navigation(_) | PortalError::Timeout(_) => true,
            PortalError::Browser(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("navigat") || msg.contains("closed")
            }
            _ => false,
        }
    }
}

impl From<CdpError> for PortalError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Timeout => PortalError::Timeout(e.to_string()),
            other => PortalError::Browser(other.to_string()),
        }
    }
}

/// 地籍号提取错误
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("未找到地籍号")]
    NoIdentifiers,

    #[error("不支持的文件类型: {0}")]
    UnsupportedFile(String),

    #[error("读取表格失败: {0}")]
    Spreadsheet(String),

    #[error("读取文件失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 报告生成错误，唯一会把成功的流水线改判为失败的错误
#[derive(Debug, Error)]
#[error("报告生成失败: {0}")]
pub struct ReportError(pub String);

impl From<rust_xlsxwriter::XlsxError> for ReportError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        ReportError(e.to_string())
    }
}

impl From<std::io::Error> for ReportError {
    fn from(e: std::io::Error) -> Self {
        ReportError(e.to_string())
    }
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("数据格式错误: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_failure_kind() {
        assert_eq!(
            MapError::PlotNotFound("1".into()).failure_kind(),
            MapFailureKind::NotFound
        );
        assert_eq!(
            MapError::Timeout("30s".into()).failure_kind(),
            MapFailureKind::Timeout
        );
        assert_eq!(
            MapError::Browser("crash".into()).failure_kind(),
            MapFailureKind::Generic
        );
    }

    #[test]
    fn test_portal_error_classes() {
        assert!(PortalError::CaptchaRejected.is_captcha());
        assert!(!PortalError::NoResults.is_captcha());
        assert!(PortalError::Navigation("net::ERR".into()).needs_restart());
        assert!(PortalError::Browser("page closed".into()).needs_restart());
        assert!(!PortalError::NoDetailLink.needs_restart());
    }

    #[test]
    fn test_cdp_timeout_is_classified_by_variant() {
        let map_err = MapError::from(CdpError::Timeout);
        assert!(matches!(map_err, MapError::Timeout(_)), "CDP 超时应归为地图超时");
        assert_eq!(map_err.failure_kind(), MapFailureKind::Timeout);

        let portal_err = PortalError::from(CdpError::Timeout);
        assert!(matches!(portal_err, PortalError::Timeout(_)));
        assert!(portal_err.needs_restart(), "门户超时需要重建子会话");
        assert!(!portal_err.is_captcha());
    }

    #[test]
    fn test_other_cdp_errors_stay_generic() {
        let map_err = MapError::from(CdpError::NoResponse);
        assert_eq!(map_err.failure_kind(), MapFailureKind::Generic);
        assert!(!PortalError::from(CdpError::NoResponse).needs_restart());
    }
}
