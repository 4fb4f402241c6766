//! 页面内执行的脚本。nspd.gov.ru 大量使用 Web Components，
//! 查询元素时需要穿透 shadowRoot，所以每段脚本都带一个 `deepAll` 帮助函数。

/// 递归查询，包括所有打开的 shadowRoot
const DEEP_QUERY: &str = r#"
    const deepAll = (root, selector) => {
        const found = Array.from(root.querySelectorAll(selector));
        for (const el of root.querySelectorAll('*')) {
            if (el.shadowRoot) {
                found.push(...deepAll(el.shadowRoot, selector));
            }
        }
        return found;
    };
    const visible = (el) => {
        const rect = el.getBoundingClientRect();
        return rect.width > 0 && rect.height > 0;
    };
"#;

/// 拼成 `(function)(args)` 的调用表达式，参数是 JSON 文本
pub fn call_js(function: &str, args: &str) -> String {
    format!("({})({})", function, args)
}

fn with_deep_query(body: &str) -> String {
    format!("(arg) => {{ {} {} }}", DEEP_QUERY, body)
}

/// 在第一个可见的匹配元素上点击，返回是否点到了
pub fn click_first_js() -> String {
    with_deep_query(
        r#"
        const el = deepAll(document, arg).find(visible);
        if (!el) return false;
        el.scrollIntoView({ block: 'center' });
        el.click();
        return true;
        "#,
    )
}

/// 是否存在可见的匹配元素
pub fn exists_js() -> String {
    with_deep_query("return deepAll(document, arg).some(visible);")
}

/// 聚焦输入框并清空，返回是否找到
pub fn focus_and_clear_js() -> String {
    with_deep_query(
        r#"
        const input = deepAll(document, arg).find(visible);
        if (!input) return false;
        input.scrollIntoView({ block: 'center' });
        input.focus();
        input.select && input.select();
        input.value = '';
        input.dispatchEvent(new Event('input', { bubbles: true }));
        return true;
        "#,
    )
}

/// 在输入框上模拟回车并提交所在表单
pub fn press_enter_js() -> String {
    with_deep_query(
        r#"
        const input = deepAll(document, arg).find(visible);
        if (!input) return false;
        for (const type of ['keydown', 'keypress', 'keyup']) {
            input.dispatchEvent(new KeyboardEvent(type, { key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true }));
        }
        const form = input.closest('form');
        if (form && form.requestSubmit) form.requestSubmit();
        return true;
        "#,
    )
}

/// 结果列表中所有按钮的文本，顺序与 `click_result_button_js` 的下标一致
pub fn result_button_texts_js() -> String {
    with_deep_query(
        r#"
        return deepAll(document, 'm-accordion')
            .flatMap(acc => deepAll(acc.shadowRoot || acc, 'button'))
            .map(btn => (btn.textContent || '').replace(/\s+/g, ' ').trim());
        "#,
    )
}

pub fn click_result_button_js() -> String {
    with_deep_query(
        r#"
        const buttons = deepAll(document, 'm-accordion')
            .flatMap(acc => deepAll(acc.shadowRoot || acc, 'button'));
        const btn = buttons[arg];
        if (!btn) return false;
        btn.scrollIntoView({ block: 'center' });
        btn.click();
        return true;
        "#,
    )
}

/// 信息面板的 outerHTML。m-typography 等组件的文本在宿主的 `text` 属性上，
/// 这里把 shadowRoot 内的文字补成 `text` 属性，方便在 Rust 侧解析
pub fn info_panel_html_js() -> String {
    with_deep_query(
        r#"
        const panel = deepAll(document, arg).find(el => el.querySelector('.info-container')
            || deepAll(el, '.info-container').length > 0);
        if (!panel) return null;
        for (const el of deepAll(panel, 'm-typography, m-string-item')) {
            if (!el.getAttribute('text')) {
                const text = (el.shadowRoot ? el.shadowRoot.textContent : el.textContent) || '';
                el.setAttribute('text', text.trim());
            }
        }
        return panel.outerHTML;
        "#,
    )
}

/// 门户验证码输入框或提示是否处于错误状态
pub const PORTAL_CAPTCHA_ERROR_JS: &str = r#"
    () => {
        const input = document.querySelector('#captcha');
        const wrapperError = input
            && (input.classList.contains('rros-ui-lib-block--error')
                || input.closest('.rros-ui-lib-input-wrapper')?.classList.contains('rros-ui-lib-input-wrapper--error'));
        const message = document.querySelector('.rros-ui-lib-input-message.rros-ui-lib-message--error');
        return Boolean(wrapperError || message);
    }
"#;

/// 把表单滚动到屏幕中央
pub const PORTAL_CENTER_FORM_JS: &str = r#"
    () => {
        const form = document.querySelector('.realestateobjects-wrapper.card');
        if (!form) return false;
        const rect = form.getBoundingClientRect();
        const middle = rect.top + window.pageYOffset - window.innerHeight / 2 + rect.height / 2;
        window.scrollTo({ top: middle });
        return true;
    }
"#;

/// 第一条结果的链接文本，没有结果返回 null
pub const PORTAL_FIRST_RESULT_JS: &str = r#"
    () => {
        const link = document.querySelector(
            '.rros-ui-lib-table__row:first-child .realestateobjects-wrapper__results__cadNumber a');
        if (!link) return null;
        link.scrollIntoView({ block: 'center' });
        link.click();
        return (link.textContent || '').trim();
    }
"#;

/// 当前页面地址
pub const LOCATION_JS: &str = "() => window.location.href";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_js_wraps_function() {
        assert_eq!(call_js("() => 1", ""), "(() => 1)()");
        let js = call_js(&click_first_js(), "\"button.close\"");
        assert!(js.starts_with("((arg) => {"));
        assert!(js.ends_with("(\"button.close\")"));
        assert!(js.contains("deepAll"));
    }
}
