//! ============================================================================
//! Message Composer - Reply payloads
//! ============================================================================
//! Pure functions from ledger/project data to outbound chat messages.
//! No I/O, no state.
//! ============================================================================

use serde_json::{json, Value};

use crate::messaging::OutboundMessage;
use crate::types::{DonationRecord, Project, DEFAULT_DISPLAY_NAME};

/// Carousels hold at most this many bubbles
const MAX_CAROUSEL_BUBBLES: usize = 12;

const PROJECT_FALLBACK_NAME: &str = "โปรเจกต์";

pub const AMOUNT_PROMPT: &str = "กรุณากรอกยอดเงินในการบริจาค เช่น 100";
pub const SELECT_PROJECT_FIRST: &str =
    "กรุณาเลือกโปรเจกต์ก่อนส่งสลิป\nพิมพ์ \"ทำบุญ\" เพื่อเลือกโปรเจกต์";
pub const PENDING_NOT_FOUND: &str = "ไม่พบข้อมูลการบริจาคที่รอการยืนยัน";
pub const CONFIRM_FAILED: &str = "เกิดข้อผิดพลาดในการยืนยันการบริจาค";
pub const GENERIC_ERROR: &str = "เกิดข้อผิดพลาด กรุณาลองใหม่อีกครั้ง";
pub const PROJECT_NOT_FOUND: &str = "ไม่พบโปรเจกต์ที่เลือก";
pub const DONATION_NOT_FOUND: &str = "ไม่พบข้อมูลการบริจาค";
pub const ALREADY_CONFIRMED: &str = "รายการนี้ยืนยันยอดแล้ว";
pub const IMAGE_ERROR: &str = "เกิดข้อผิดพลาดในการประมวลผลรูปภาพ กรุณาลองใหม่อีกครั้ง";
pub const NO_OPEN_PROJECTS: &str = "ขณะนี้ยังไม่มีโปรเจกต์ที่เปิดรับบริจาค";
pub const NO_DONATIONS_TODAY: &str = "ยังไม่มีการบริจาควันนี้";
const PROJECT_LIST_HEADER: &str = "🙏 เลือกโครงการที่ต้องการทำบุญ";

/// A single text message
pub fn notice(text: &str) -> Vec<OutboundMessage> {
    vec![OutboundMessage::text(text)]
}

/// Format an amount with thousands separators, dropping a zero fraction
pub fn format_baht(amount: f64) -> String {
    let negative = amount < 0.0;
    let rounded = (amount.abs() * 100.0).round() / 100.0;
    let whole = rounded.trunc() as u64;
    let cents = ((rounded - rounded.trunc()) * 100.0).round() as u64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if cents > 0 {
        grouped.push_str(&format!(".{:02}", cents));
    }
    if negative {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Reply to a project selection: name, optional PromptPay QR, instructions
pub fn project_selected(project: &Project) -> Vec<OutboundMessage> {
    match &project.promptpay_qr_url {
        Some(qr_url) if !qr_url.trim().is_empty() => vec![
            OutboundMessage::text(format!(
                "คุณเลือกโปรเจกต์: {}\n\nสแกน QR PromptPay เพื่อทำบุญ",
                project.name
            )),
            OutboundMessage::image(qr_url.trim()),
            OutboundMessage::text("โอนแล้วส่งรูปสลิปเพื่อยืนยันยอดได้เลยค่ะ"),
        ],
        _ => vec![OutboundMessage::text(format!(
            "คุณเลือกโปรเจกต์: {}\n\nกรุณาส่งรูปสลิปโอนเงินมาได้เลยค่ะ",
            project.name
        ))],
    }
}

fn label_row(label: &str, value: String, color: &str) -> Value {
    json!({
        "type": "box",
        "layout": "baseline",
        "spacing": "sm",
        "contents": [
            {"type": "text", "text": label, "color": "#7E8691", "size": "sm", "flex": 2},
            {"type": "text", "text": value, "wrap": true, "color": color, "size": "sm",
             "flex": 3, "align": "end", "weight": "bold"}
        ]
    })
}

fn project_bubble(project: &Project) -> Value {
    let mut rows = vec![label_row(
        "ยอดปัจจุบัน",
        format!("{} บาท", format_baht(project.current_amount)),
        "#17A44A",
    )];
    if let Some(goal) = project.goal_amount.filter(|g| *g > 0.0) {
        rows.push(label_row("เป้าหมาย", format!("{} บาท", format_baht(goal)), "#1C1C1C"));
    }

    json!({
        "type": "bubble",
        "header": {
            "type": "box",
            "layout": "vertical",
            "contents": [
                {"type": "text", "text": project.name.trim(), "weight": "bold", "size": "lg", "color": "#5B4E91"}
            ]
        },
        "body": {
            "type": "box",
            "layout": "vertical",
            "contents": [
                {"type": "text", "text": project.description.as_deref().unwrap_or("ไม่มีคำอธิบาย").trim(),
                 "wrap": true, "size": "sm", "color": "#7E8691"},
                {"type": "box", "layout": "vertical", "margin": "lg", "spacing": "sm", "contents": rows}
            ]
        },
        "footer": {
            "type": "box",
            "layout": "vertical",
            "contents": [{
                "type": "button",
                "style": "primary",
                "color": "#5B4E91",
                "action": {
                    "type": "postback",
                    "label": "ทำบุญ",
                    "data": format!("action=select_project&project_id={}", project.id),
                    "displayText": format!("ทำบุญ {}", project.name.trim())
                }
            }]
        }
    })
}

/// Header text plus a carousel of open projects
pub fn project_list(projects: &[Project]) -> Vec<OutboundMessage> {
    if projects.is_empty() {
        return notice(NO_OPEN_PROJECTS);
    }
    let bubbles: Vec<Value> = projects
        .iter()
        .take(MAX_CAROUSEL_BUBBLES)
        .map(project_bubble)
        .collect();

    vec![
        OutboundMessage::text(PROJECT_LIST_HEADER),
        OutboundMessage::Flex {
            alt_text: "รายการโครงการ".to_string(),
            contents: json!({"type": "carousel", "contents": bubbles}),
        },
    ]
}

/// Thank-you card sent after a confirmation
pub fn thank_you(
    display_name: &str,
    amount: f64,
    project: Option<&Project>,
    thank_you_message: &str,
) -> OutboundMessage {
    let display_name = if display_name.trim().is_empty() {
        DEFAULT_DISPLAY_NAME
    } else {
        display_name.trim()
    };
    let project_name = project.map(|p| p.name.as_str()).unwrap_or(PROJECT_FALLBACK_NAME);

    let mut rows = vec![
        label_row("ผู้บริจาค", display_name.to_string(), "#1C1C1C"),
        label_row("ยอดบริจาค", format!("{} บาท", format_baht(amount)), "#17A44A"),
        label_row("โครงการ", project_name.to_string(), "#1C1C1C"),
    ];
    if let Some(destination) = project.and_then(|p| p.destination.as_deref()).filter(|d| !d.trim().is_empty()) {
        rows.push(label_row("ผู้รับ", destination.trim().to_string(), "#1C1C1C"));
    }

    OutboundMessage::Flex {
        alt_text: format!("{} {} บาท", thank_you_message, format_baht(amount)),
        contents: json!({
            "type": "bubble",
            "body": {
                "type": "box",
                "layout": "vertical",
                "spacing": "md",
                "contents": [
                    {"type": "text", "text": thank_you_message, "weight": "bold", "size": "lg",
                     "color": "#5B4E91", "wrap": true},
                    {"type": "box", "layout": "vertical", "spacing": "sm", "contents": rows}
                ]
            }
        }),
    }
}

/// Per-project summary card: total, count and the latest donors
pub fn daily_summary(
    project_name: &str,
    total_amount: f64,
    donation_count: usize,
    recent: &[DonationRecord],
) -> OutboundMessage {
    let donors: Vec<Value> = recent
        .iter()
        .map(|d| {
            let name = if d.is_anonymous {
                "ไม่ประสงค์ออกนาม"
            } else {
                d.display_name.as_str()
            };
            label_row(name, format!("{} บาท", format_baht(d.final_amount)), "#1C1C1C")
        })
        .collect();

    OutboundMessage::Flex {
        alt_text: format!("สรุปยอดวันนี้ {} {} บาท", project_name, format_baht(total_amount)),
        contents: json!({
            "type": "bubble",
            "header": {
                "type": "box",
                "layout": "vertical",
                "contents": [
                    {"type": "text", "text": "สรุปยอดวันนี้", "size": "sm", "color": "#7E8691"},
                    {"type": "text", "text": project_name, "weight": "bold", "size": "lg", "color": "#5B4E91", "wrap": true}
                ]
            },
            "body": {
                "type": "box",
                "layout": "vertical",
                "spacing": "sm",
                "contents": [
                    label_row("ยอดรวม", format!("{} บาท", format_baht(total_amount)), "#17A44A"),
                    label_row("จำนวนรายการ", format!("{} รายการ", donation_count), "#1C1C1C"),
                    {"type": "separator", "margin": "md"},
                    {"type": "box", "layout": "vertical", "margin": "md", "spacing": "sm", "contents": donors}
                ]
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectStatus;

    fn project(qr: Option<&str>) -> Project {
        Project {
            id: "p1".into(),
            name: "Temple roof".into(),
            description: None,
            destination: Some("Wat Pho".into()),
            promptpay_qr_url: qr.map(String::from),
            goal_amount: Some(50_000.0),
            current_amount: 1_500.0,
            total_expenses: 0.0,
            status: ProjectStatus::Active,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_format_baht() {
        assert_eq!(format_baht(0.0), "0");
        assert_eq!(format_baht(100.0), "100");
        assert_eq!(format_baht(1500.0), "1,500");
        assert_eq!(format_baht(1_234_567.0), "1,234,567");
        assert_eq!(format_baht(99.5), "99.50");
        assert_eq!(format_baht(-2500.0), "-2,500");
    }

    #[test]
    fn test_project_selected_with_and_without_qr() {
        let with_qr = project_selected(&project(Some("https://x/qr.png")));
        assert_eq!(with_qr.len(), 3);
        assert!(matches!(&with_qr[1], OutboundMessage::Image { original_content_url, .. } if original_content_url == "https://x/qr.png"));

        let without = project_selected(&project(None));
        assert_eq!(without.len(), 1);
    }

    #[test]
    fn test_project_list_postback_data() {
        let messages = project_list(&[project(None)]);
        assert_eq!(messages.len(), 2);
        let OutboundMessage::Flex { contents, .. } = &messages[1] else {
            panic!("expected flex carousel");
        };
        assert_eq!(contents["type"], "carousel");
        assert_eq!(
            contents["contents"][0]["footer"]["contents"][0]["action"]["data"],
            "action=select_project&project_id=p1"
        );

        assert_eq!(project_list(&[]), notice(NO_OPEN_PROJECTS));
    }

    #[test]
    fn test_thank_you_falls_back_on_blank_name() {
        let message = thank_you("  ", 1500.0, None, "ขอบคุณ");
        let OutboundMessage::Flex { alt_text, contents } = message else {
            panic!("expected flex");
        };
        assert!(alt_text.contains("1,500"));
        let rendered = contents.to_string();
        assert!(rendered.contains(DEFAULT_DISPLAY_NAME));
        assert!(rendered.contains(PROJECT_FALLBACK_NAME));
    }
}
