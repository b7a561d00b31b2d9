//! Email bodies sent by the contact flow.

use crate::mailer::EmailMessage;
use crate::session::ContactForm;

const OTP_SUBJECT: &str = "Verification Code";

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub(crate) fn otp_email(to: &str, code: &str, ttl_seconds: u64) -> EmailMessage {
    let minutes = ttl_seconds.div_ceil(60).max(1);
    let html_body = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: Arial, sans-serif; line-height: 1.5; max-width: 560px; margin: 0 auto; padding: 20px; color: #333;">
  <h2 style="color: #444; border-bottom: 1px solid #ddd; padding-bottom: 10px;">Email verification code</h2>
  <p>To complete your submission, enter the following verification code:</p>
  <div style="background-color: #f5f5f5; border: 2px solid #007cba; border-radius: 8px; padding: 20px; text-align: center; margin: 20px 0;">
    <h1 style="color: #007cba; margin: 0; font-size: 2.5em; letter-spacing: 0.2em;">{code}</h1>
  </div>
  <p><strong>Important:</strong> this code is valid for {minutes} minutes only.</p>
  <p style="color: #666; font-size: 0.9em;">If you did not make this request, please ignore this email.</p>
</body>
</html>
"#
    );
    EmailMessage {
        to: to.to_string(),
        subject: OTP_SUBJECT.to_string(),
        html_body,
    }
}

pub(crate) fn notification_email(recipient: &str, submission_id: &str, form: &ContactForm) -> EmailMessage {
    let first_name = escape_html(&form.first_name);
    let last_name = escape_html(&form.last_name);
    let phone = escape_html(&form.phone);
    let email = escape_html(&form.email);
    let comments = escape_html(&form.comments);

    let html_body = format!(
        r#"Submission ID: #{submission_id}

<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: Arial, sans-serif; line-height: 1.5; max-width: 560px; margin: 0 auto; padding: 20px; color: #333;">
  <h2 style="color: #444; border-bottom: 1px solid #ddd; padding-bottom: 10px;">New contact request</h2>
  <table style="width: 100%; border-spacing: 0; margin-bottom: 20px;">
    <tr><td style="padding: 8px 0;"><strong>First name:</strong> {first_name}</td></tr>
    <tr><td style="padding: 8px 0;"><strong>Last name:</strong> {last_name}</td></tr>
    <tr><td style="padding: 8px 0;"><strong>Phone:</strong> {phone}</td></tr>
    <tr><td style="padding: 8px 0;"><strong>Email:</strong> <a href="mailto:{email}">{email}</a></td></tr>
  </table>
  <div style="border: 1px solid currentColor; border-radius: 4px; padding: 15px; margin: 20px 0;">
    <div style="white-space: pre-wrap;">{comments}</div>
  </div>
  <div style="color: #666; font-size: 0.9em; margin-top: 20px;">
    Reference ID: #{submission_id}<br>
    <em>Email verified via one-time code</em>
  </div>
</body>
</html>
"#
    );

    EmailMessage {
        to: recipient.to_string(),
        subject: format!(
            "New contact request #{submission_id} - {} {}",
            form.first_name, form.last_name
        ),
        html_body,
    }
}
