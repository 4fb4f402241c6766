//! 从 api-cloud 返回的对象里取地块坐标
//!
//! 不同对象的 JSON 结构不一致，这里按固定优先级依次尝试几种已知形状，
//! 第一个命中的策略胜出。

use serde_json::Value;

use crate::core::PositionHint;

/// 一种命名的坐标提取方式
#[derive(Clone, Copy)]
pub struct CoordinateStrategy {
    pub name: &'static str,
    pub extract: fn(&Value) -> Option<PositionHint>,
}

/// 按优先级排列
pub const STRATEGIES: &[CoordinateStrategy] = &[
    CoordinateStrategy {
        name: "geometry",
        extract: from_geometry,
    },
    CoordinateStrategy {
        name: "root_center",
        extract: from_root_center,
    },
    CoordinateStrategy {
        name: "land_xy",
        extract: from_land_fields,
    },
    CoordinateStrategy {
        name: "root_xy",
        extract: from_root_fields,
    },
];

/// 依次尝试所有策略，返回命中的策略名和坐标
pub fn extract_coordinates(object: &Value) -> Option<(&'static str, PositionHint)> {
    STRATEGIES
        .iter()
        .find_map(|strategy| (strategy.extract)(object).map(|point| (strategy.name, point)))
}

fn from_geometry(object: &Value) -> Option<PositionHint> {
    let geometry = first_present(object, &["geometry", "coordinates"])?;
    match geometry {
        Value::Object(_) => {
            let center = first_present(geometry, &["centerPoint", "centroid"])?;
            point_from_value(center)
        }
        Value::Array(_) => point_from_array(geometry),
        _ => None,
    }
}

fn from_root_center(object: &Value) -> Option<PositionHint> {
    let center = first_present(object, &["centerPoint", "centroid"])?;
    point_from_value(center)
}

fn from_land_fields(object: &Value) -> Option<PositionHint> {
    object.get("land").and_then(point_from_fields)
}

fn from_root_fields(object: &Value) -> Option<PositionHint> {
    point_from_fields(object)
}

/// 中心点可能是 [x, y] 数组，也可能是 {x, y} / {lon, lat} 对象
fn point_from_value(value: &Value) -> Option<PositionHint> {
    match value {
        Value::Array(_) => point_from_array(value),
        Value::Object(_) => point_from_fields(value),
        _ => None,
    }
}

fn point_from_array(value: &Value) -> Option<PositionHint> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    Some(PositionHint {
        x: number(&items[0])?,
        y: number(&items[1])?,
    })
}

fn point_from_fields(value: &Value) -> Option<PositionHint> {
    let x = ["x", "lon", "longitude"]
        .iter()
        .find_map(|key| value.get(*key).and_then(number))?;
    let y = ["y", "lat", "latitude"]
        .iter()
        .find_map(|key| value.get(*key).and_then(number))?;
    Some(PositionHint { x, y })
}

/// 取第一个非空字段
fn first_present<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| is_present(v))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// 数字可能以字符串形式返回
pub(crate) fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}
