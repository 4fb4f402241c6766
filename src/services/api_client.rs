use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::config::{ApiConfig, MIN_API_TIMEOUT_SECS};
use crate::core::{EnrichedRecord, PositionHint, SourceError};
use crate::services::coordinates::{extract_coordinates, number};

pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_API_ERROR: &str = "API_ERROR";

/// 主数据源。业务上的“查不到/报错”以带错误码的记录返回，
/// 只有未配置和连接失败会返回 Err。
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn fetch_one(&self, identifier: &str) -> Result<EnrichedRecord, SourceError>;

    async fn check_availability(&self) -> Result<bool, SourceError>;

    async fn account_balance(&self) -> Result<Option<f64>, SourceError>;
}

/// api-cloud.ru 的 Rosreestr 接口
pub struct ApiCloudClient {
    http: Client,
    config: ApiConfig,
}

impl ApiCloudClient {
    pub fn new(config: ApiConfig) -> Result<Self, SourceError> {
        let timeout = config.timeout_secs.max(MIN_API_TIMEOUT_SECS);
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| SourceError::Http(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn token(&self) -> Result<&str, SourceError> {
        self.config
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(SourceError::NotConfigured)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl RecordSource for ApiCloudClient {
    fn is_configured(&self) -> bool {
        self.config.simulation || self.token().is_ok()
    }

    async fn fetch_one(&self, identifier: &str) -> Result<EnrichedRecord, SourceError> {
        if self.config.simulation {
            return Ok(simulated_record(identifier));
        }
        let token = self.token()?;

        debug!("请求 api-cloud: {}", identifier);
        let response = self
            .http
            .get(self.endpoint("api/rosreestr.php"))
            .header("Token", token)
            .query(&[("type", "object"), ("cadastr", identifier), ("token", token)])
            .send()
            .await?;
        let body: Value = response.json().await?;
        Ok(parse_object_response(identifier, &body))
    }

    async fn check_availability(&self) -> Result<bool, SourceError> {
        if self.config.simulation {
            return Ok(true);
        }
        Ok(self.account_balance().await?.is_some())
    }

    async fn account_balance(&self) -> Result<Option<f64>, SourceError> {
        if self.config.simulation {
            return Ok(Some(5000.0));
        }
        let token = self.token()?;

        let response = self
            .http
            .get(self.endpoint("api/apilk.php"))
            .header("Token", token)
            .query(&[("type", "balance"), ("token", token)])
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("查询余额失败: HTTP {}", response.status());
            return Ok(None);
        }
        let body: Value = response.json().await?;
        Ok(parse_balance_response(&body))
    }
}

fn response_status(body: &Value) -> Option<i64> {
    body.get("status").and_then(|s| match s {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn inquiry_balance(body: &Value) -> Option<f64> {
    body.get("inquiry")
        .and_then(|inquiry| inquiry.get("balance"))
        .and_then(number)
}

pub fn parse_balance_response(body: &Value) -> Option<f64> {
    if response_status(body) != Some(200) {
        let message = body.get("message").and_then(Value::as_str).unwrap_or("");
        warn!("查询余额返回错误: {}", message);
        return None;
    }
    body.get("balance").and_then(number)
}

/// 把 rosreestr.php 的响应转成记录
pub fn parse_object_response(identifier: &str, body: &Value) -> EnrichedRecord {
    let balance = inquiry_balance(body);

    if response_status(body) == Some(200) {
        let found = body.get("found").and_then(Value::as_bool).unwrap_or(false);
        if found {
            let empty = Value::Null;
            let object = body.get("object").unwrap_or(&empty);
            let mut record = parse_object(identifier, object);
            record.api_balance = balance;
            return record;
        }
        warn!("{} 在 api-cloud 中未找到", identifier);
        let mut record = EnrichedRecord::failed(identifier, CODE_NOT_FOUND, "Данные не найдены");
        record.api_balance = balance;
        return record;
    }

    let code = match body.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "UNKNOWN_ERROR".to_string(),
    };
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Ошибка API: {}", code));
    warn!("api-cloud 返回错误 {}: {} ({})", identifier, message, code);
    let mut record = EnrichedRecord::failed(identifier, code, message);
    record.api_balance = balance;
    record
}

fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() && s != "null" => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_object(identifier: &str, object: &Value) -> EnrichedRecord {
    let mut record = EnrichedRecord::new(identifier);

    record.object_type = text(object, "ObjectType");
    record.address = object.get("address").and_then(|a| text(a, "readableAddress"));
    record.category = object.get("land").and_then(|l| text(l, "landCategory"));
    record.permitted_use = object
        .get("permittedUse")
        .and_then(Value::as_array)
        .and_then(|uses| uses.first())
        .and_then(|first| text(first, "transcript"));

    record.area = object.get("area").and_then(number).or_else(|| {
        object
            .get("mainCharacters")
            .and_then(|m| m.get("value"))
            .and_then(number)
    });
    record.cadastral_value = object.get("cadCost").and_then(number);
    record.cadastral_cost_date = text(object, "cadCostDate");

    record.rights = join_entries(object.get("rights"), |right| {
        let kind = text(right, "rightTypeDesc")?;
        Some(match text(right, "part") {
            Some(part) => format!("{} ({})", kind, part),
            None => kind,
        })
    });
    record.encumbrances = join_entries(object.get("encumbrances"), |e| text(e, "typeDesc"));

    record.status = text(object, "status").map(|s| {
        if s == "1" {
            "Актуально".to_string()
        } else {
            "Не актуально".to_string()
        }
    });
    record.level = text(object, "level");
    record.purpose = text(object, "purpose");
    record.reg_date = text(object, "regDate");
    record.date_assigned = record.reg_date.clone();
    record.info_update_date = text(object, "infoUpdate");
    record.old_cadastral_number = object
        .get("oldNumbers")
        .and_then(Value::as_array)
        .and_then(|nums| nums.first())
        .and_then(|first| text(first, "numValue"));

    if record.is_land_plot() {
        match extract_coordinates(object) {
            Some((strategy, point)) => {
                debug!("{} 坐标来自 {}: ({}, {})", identifier, strategy, point.x, point.y);
                record.coordinates = Some(point);
            }
            None => warn!("⚠️ 地块 {} 没有坐标", identifier),
        }
    }
    record
}

fn join_entries(list: Option<&Value>, describe: impl Fn(&Value) -> Option<String>) -> Option<String> {
    let parts: Vec<String> = list?.as_array()?.iter().filter_map(describe).collect();
    (!parts.is_empty()).then(|| parts.join("; "))
}

/// 模拟模式下的固定数据，按号码末位决定对象类型
pub fn simulated_record(identifier: &str) -> EnrichedRecord {
    const TYPES: [&str; 4] = ["Земельный участок", "Здание", "Помещение", "Сооружение"];

    info!("[模拟] 获取 {}", identifier);
    let digits: u64 = identifier
        .chars()
        .filter(|c| c.is_ascii_digit())
        .rev()
        .take(6)
        .collect::<String>()
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    let object_type = if identifier.ends_with(":1115") {
        TYPES[0]
    } else {
        TYPES[(digits % 10) as usize % TYPES.len()]
    };

    let mut record = EnrichedRecord::new(identifier);
    record.object_type = Some(object_type.to_string());
    record.address = Some(format!(
        "Российская Федерация, г. Санкт-Петербург, ул. Тестовая, д. {}",
        digits % 100 + 1
    ));
    record.area = Some(500.0 + (digits % 4500) as f64);
    record.cadastral_value = Some(1_000_000.0 + (digits % 9_000_000) as f64 + 0.11);
    record.rights = Some("Право собственности".to_string());
    record.status = Some("Актуально".to_string());
    record.date_assigned = Some("01.01.2020".to_string());
    record.api_balance = Some(5000.0);
    if record.is_land_plot() {
        record.category = Some("Земли населённых пунктов".to_string());
        record.permitted_use = Some("Для размещения объектов жилой застройки".to_string());
        record.coordinates = Some(PositionHint {
            x: 3_000_000.0 + digits as f64,
            y: 8_000_000.0 + digits as f64,
        });
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_found_object() {
        let body = json!({
            "status": 200,
            "found": true,
            "inquiry": {"balance": "1234.5"},
            "object": {
                "ObjectType": "Земельный участок",
                "address": {"readableAddress": "г. Санкт-Петербург, п. Ушково"},
                "land": {"landCategory": "Земли населённых пунктов"},
                "permittedUse": [{"transcript": "Для размещения дач"}],
                "area": "2956",
                "cadCost": "24224607.11",
                "rights": [
                    {"rightTypeDesc": "Общая долевая собственность", "part": "1/2"},
                    {"rightTypeDesc": "Собственность"}
                ],
                "encumbrances": [{"typeDesc": "Доверительное управление"}],
                "status": "1",
                "oldNumbers": [{"numValue": "78:38:22629:15"}],
                "centerPoint": [3297753.12, 8443359.31]
            }
        });
        let record = parse_object_response("78:38:0022629:1115", &body);
        assert!(!record.has_error());
        assert_eq!(record.area, Some(2956.0));
        assert_eq!(record.cadastral_value, Some(24224607.11));
        assert_eq!(
            record.rights.as_deref(),
            Some("Общая долевая собственность (1/2); Собственность")
        );
        assert_eq!(record.encumbrances.as_deref(), Some("Доверительное управление"));
        assert_eq!(record.status.as_deref(), Some("Актуально"));
        assert_eq!(record.old_cadastral_number.as_deref(), Some("78:38:22629:15"));
        assert_eq!(record.api_balance, Some(1234.5));
        assert!(record.coordinates.is_some(), "地块应解析出坐标");
    }

    #[test]
    fn test_area_falls_back_to_main_characters() {
        let body = json!({
            "status": 200,
            "found": true,
            "object": {"ObjectType": "Здание", "mainCharacters": {"value": 120.5}}
        });
        let record = parse_object_response("78:38:0022629:1006", &body);
        assert_eq!(record.area, Some(120.5));
        assert!(record.coordinates.is_none(), "非地块不取坐标");
    }

    #[test]
    fn test_not_found_and_error_codes() {
        let not_found = parse_object_response("1:1:1:1", &json!({"status": 200, "found": false}));
        assert_eq!(not_found.error_code.as_deref(), Some(CODE_NOT_FOUND));

        let error = parse_object_response(
            "1:1:1:1",
            &json!({"status": 403, "error": 4, "message": "Недостаточно средств"}),
        );
        assert_eq!(error.error_code.as_deref(), Some("4"));
        assert_eq!(error.error.as_deref(), Some("Недостаточно средств"));
    }

    #[test]
    fn test_parse_balance() {
        assert_eq!(parse_balance_response(&json!({"status": 200, "balance": 99.9})), Some(99.9));
        assert_eq!(parse_balance_response(&json!({"status": 401, "message": "bad token"})), None);
    }

    #[tokio::test]
    async fn test_missing_token_is_not_configured() {
        let client = ApiCloudClient::new(ApiConfig::default()).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(
            client.fetch_one("78:38:0022629:1115").await,
            Err(SourceError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_simulation_mode() {
        let client = ApiCloudClient::new(ApiConfig {
            simulation: true,
            ..ApiConfig::default()
        })
        .unwrap();
        assert!(client.check_availability().await.unwrap());
        let record = client.fetch_one("78:38:0022629:1115").await.unwrap();
        assert!(record.is_land_plot());
        assert_eq!(record, simulated_record("78:38:0022629:1115"), "模拟数据应是确定的");
    }
}
