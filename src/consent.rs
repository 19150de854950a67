//! Consent page rendering and consent-token verification.
//!
//! The approval page embeds the transaction id and a separate consent token
//! as hidden form fields and offers exactly two actions, approve and deny.
//! All client-supplied strings (name, URIs, scopes) pass through
//! [`escape_html`] before rendering; a consent token that does not match the
//! stored one is a CSRF signal and fails closed.

use subtle::ConstantTimeEq;

use crate::config::ClientConfig;

/// HTML-escape a string for safe interpolation into the consent page.
#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Constant-time comparison of a submitted consent token against the stored one.
#[must_use]
pub fn consent_token_matches(submitted: &str, stored: &str) -> bool {
    submitted.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Render the consent approval page for a pending authorization.
#[must_use]
pub fn render_consent_page(
    client: &ClientConfig,
    scopes: &[String],
    txn_id: &str,
    consent_token: &str,
) -> String {
    let name = escape_html(&client.name);
    let logo = client.logo_uri.as_deref().map_or_else(String::new, |uri| {
        format!(
            r#"<img class="logo" src="{}" alt="">"#,
            escape_html(uri)
        )
    });
    let homepage = client.client_uri.as_deref().map_or_else(
        || name.clone(),
        |uri| format!(r#"<a href="{}">{}</a>"#, escape_html(uri), name),
    );

    let scope_items: String = scopes
        .iter()
        .map(|s| format!("<li><code>{}</code></li>", escape_html(s)))
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorize {name}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
            color: white;
        }}
        .container {{
            text-align: center;
            padding: 2rem;
            background: rgba(255,255,255,0.1);
            border-radius: 16px;
            backdrop-filter: blur(10px);
            max-width: 420px;
        }}
        .logo {{ max-width: 64px; max-height: 64px; margin-bottom: 1rem; }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        p {{ margin: 0 0 1rem 0; opacity: 0.9; }}
        ul {{ text-align: left; margin: 0 0 1.5rem 0; }}
        a {{ color: white; }}
        .actions {{ display: flex; gap: 1rem; justify-content: center; }}
        button {{
            padding: 0.6rem 2rem;
            border: none;
            border-radius: 8px;
            font-size: 1rem;
            cursor: pointer;
        }}
        .approve {{ background: #2ecc71; color: white; }}
        .deny {{ background: rgba(255,255,255,0.2); color: white; }}
    </style>
</head>
<body>
    <div class="container">
        {logo}
        <h1>Authorize {homepage}</h1>
        <p>This application is requesting access with the following scopes:</p>
        <ul>{scope_items}</ul>
        <form method="post" action="/consent">
            <input type="hidden" name="transaction_state" value="{txn}">
            <input type="hidden" name="consent_token" value="{token}">
            <div class="actions">
                <button class="approve" type="submit" name="consent_action" value="approve">Approve</button>
                <button class="deny" type="submit" name="consent_action" value="deny">Deny</button>
            </div>
        </form>
    </div>
</body>
</html>"#,
        txn = escape_html(txn_id),
        token = escape_html(consent_token),
    )
}

/// Render a terminal failure page.
#[must_use]
pub fn render_error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Failed</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #e74c3c 0%, #c0392b 100%);
            color: white;
        }}
        .container {{
            text-align: center;
            padding: 2rem;
            background: rgba(255,255,255,0.1);
            border-radius: 16px;
            backdrop-filter: blur(10px);
            max-width: 400px;
        }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        p {{ margin: 0; opacity: 0.9; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Authorization Failed</h1>
        <p>{description}</p>
        <p class="error-code">Error: {error}</p>
    </div>
</body>
</html>"#,
        description = escape_html(description),
        error = escape_html(error),
    )
}
