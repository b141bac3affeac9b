//! Bodies for the one-time-code e-mails.

pub struct Rendered {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn verification(username: &str, code: &str, expiry_minutes: u64) -> Rendered {
    let text = format!(
        "TradingBot - Email Verification\n\n\
         Welcome, {username}!\n\n\
         Your verification code is: {code}\n\n\
         This code will expire in {expiry_minutes} minutes.\n\n\
         If you didn't request this verification, please ignore this email.\n"
    );
    let html = wrap_html(
        &format!("Welcome, {username}!"),
        "Thank you for signing up for TradingBot. To complete your registration, enter the verification code below:",
        code,
        expiry_minutes,
        "If you didn't request this verification, please ignore this email.",
    );
    Rendered {
        subject: "TradingBot - Verify Your Email".to_string(),
        text,
        html,
    }
}

pub fn password_reset(username: &str, code: &str, expiry_minutes: u64) -> Rendered {
    let text = format!(
        "TradingBot - Password Reset\n\n\
         Hi {username},\n\n\
         We received a request to reset your password.\n\n\
         Your password reset code is: {code}\n\n\
         This code will expire in {expiry_minutes} minutes.\n\n\
         If you didn't request a password reset, you can safely ignore this email.\n"
    );
    let html = wrap_html(
        "Password Reset Request",
        &format!(
            "Hi {username}, we received a request to reset your password. Use the code below to set a new password:"
        ),
        code,
        expiry_minutes,
        "If you didn't request a password reset, you can safely ignore this email. Your password will remain unchanged.",
    );
    Rendered {
        subject: "TradingBot - Reset Your Password".to_string(),
        text,
        html,
    }
}

pub fn password_change(username: &str, code: &str, expiry_minutes: u64) -> Rendered {
    let text = format!(
        "TradingBot - Password Change Verification\n\n\
         Hi {username},\n\n\
         You've requested to change your password.\n\n\
         Your verification code is: {code}\n\n\
         This code will expire in {expiry_minutes} minutes.\n\n\
         If you didn't request this, please secure your account immediately.\n"
    );
    let html = wrap_html(
        "Password Change Request",
        &format!(
            "Hi {username}, you've requested to change your password. Enter the code below to confirm:"
        ),
        code,
        expiry_minutes,
        "If you didn't request this, please secure your account immediately.",
    );
    Rendered {
        subject: "TradingBot - Password Change Verification".to_string(),
        text,
        html,
    }
}

fn wrap_html(heading: &str, lead: &str, code: &str, expiry_minutes: u64, footer: &str) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
  <h1 style="color: #0a1628;">TradingBot</h1>
  <h2 style="color: #0a1628;">{heading}</h2>
  <p style="color: #5b6b8b; font-size: 16px;">{lead}</p>
  <div style="border: 2px dashed #0052ff; border-radius: 12px; padding: 25px; text-align: center; margin: 30px 0;">
    <span style="font-size: 36px; font-weight: 700; letter-spacing: 8px; color: #0052ff;">{code}</span>
  </div>
  <p style="color: #5b6b8b; font-size: 14px;">This code will expire in <strong>{expiry_minutes} minutes</strong>.</p>
  <p style="color: #5b6b8b; font-size: 14px;">{footer}</p>
</div>"#,
        heading = escape(heading),
        lead = escape(lead),
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
