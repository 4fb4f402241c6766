/// 清理文件名中的非法字符（地籍号里的冒号也会被替换）
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

/// 按字符截断，避免切到多字节字符中间
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// 俄式数字格式：无千分位，逗号作小数点；整数不带小数
pub fn format_area(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value).replace('.', ",")
    }
}

pub fn format_money(value: f64) -> String {
    format!("{:.2}", value).replace('.', ",")
}
