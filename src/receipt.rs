//! Single-page PDF receipts. The documents are plain text laid out with the
//! two standard Helvetica faces, so no font embedding is needed.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Enrollment, Payment};

const PAGE_WIDTH: u32 = 595;
const PAGE_HEIGHT: u32 = 842;
const MARGIN: u32 = 50;

pub const SCHOOL_NAME: &str = "TELLYTECH";
const SCHOOL_LINES: [&str; 3] = [
    "Vocational Training School",
    "Dakar, Senegal",
    "contact@tellytech.local",
];

#[derive(Debug, Clone)]
pub struct ReceiptDoc {
    pub title: String,
    pub number: String,
    pub issued_at: DateTime<Utc>,
    pub badge: Option<String>,
    pub lines: Vec<(String, String)>,
    pub total: (String, String),
    pub footer: String,
}

/// Short human-facing number derived from a record id.
pub fn receipt_number(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("N° {}", simple[..8].to_ascii_uppercase())
}

/// `1250000` → `1 250 000 FCFA`.
pub fn format_amount(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(c);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{}{} FCFA", sign, grouped)
}

pub fn payment_receipt_path(payment_id: &Uuid) -> String {
    format!("receipts/payments/{}.pdf", payment_id)
}

pub fn payment_receipt_name(month: i32) -> String {
    format!("receipt-month-{}-tellytech.pdf", month)
}

pub fn payment_receipt(enrollment: &Enrollment, payment: &Payment, issued_at: DateTime<Utc>) -> Vec<u8> {
    render(&ReceiptDoc {
        title: "MONTHLY PAYMENT RECEIPT".to_string(),
        number: receipt_number(&payment.id),
        issued_at,
        badge: Some(format!("MONTH {}", payment.month)),
        lines: vec![
            ("Student".to_string(), enrollment.full_name()),
            ("Email".to_string(), enrollment.email.clone()),
            ("Phone".to_string(), enrollment.phone.clone()),
            ("Formation".to_string(), enrollment.formation.clone()),
            ("Month".to_string(), payment.month.to_string()),
        ],
        total: ("Amount paid".to_string(), format_amount(payment.amount)),
        footer: "This receipt confirms the validation of the monthly payment above.".to_string(),
    })
}

pub fn enrollment_receipt(enrollment: &Enrollment, issued_at: DateTime<Utc>) -> Vec<u8> {
    let mut lines = vec![
        ("Student".to_string(), enrollment.full_name()),
        ("Email".to_string(), enrollment.email.clone()),
        ("Phone".to_string(), enrollment.phone.clone()),
        ("Formation".to_string(), enrollment.formation.clone()),
    ];
    if let Some(terms) = enrollment.terms() {
        lines.push(("Duration".to_string(), format!("{} months", terms.months)));
        lines.push(("Monthly fee".to_string(), format_amount(terms.monthly_fee)));
        lines.push(("Tuition total".to_string(), format_amount(terms.total_due())));
    }
    render(&ReceiptDoc {
        title: "ENROLLMENT RECEIPT".to_string(),
        number: receipt_number(&enrollment.id),
        issued_at,
        badge: None,
        lines,
        total: (
            "Enrollment fee".to_string(),
            format_amount(enrollment.enrollment_fee.unwrap_or(0)),
        ),
        footer: "Monthly payments are due before the 10th of each month.".to_string(),
    })
}

/// Latin-1 bytes for a PDF literal string; anything outside becomes `?`.
fn pdf_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(b'(');
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            c if (c as u32) < 0x20 => out.push(b' '),
            c if (c as u32) <= 0xFF => out.push(c as u32 as u8),
            _ => out.push(b'?'),
        }
    }
    out.push(b')');
    out
}

struct Page {
    ops: Vec<u8>,
}

impl Page {
    fn text(&mut self, font: &str, size: u32, x: u32, y: u32, text: &str) {
        self.ops
            .extend_from_slice(format!("BT /{} {} Tf {} {} Td ", font, size, x, y).as_bytes());
        self.ops.extend_from_slice(&pdf_text(text));
        self.ops.extend_from_slice(b" Tj ET\n");
    }

    fn rule(&mut self, y: u32) {
        self.ops.extend_from_slice(
            format!("0.85 G {} {} m {} {} l S 0 G\n", MARGIN, y, PAGE_WIDTH - MARGIN, y).as_bytes(),
        );
    }
}

pub fn render(doc: &ReceiptDoc) -> Vec<u8> {
    let mut page = Page { ops: Vec::new() };
    let right = PAGE_WIDTH - MARGIN - 170;

    page.text("F2", 14, right, 800, SCHOOL_NAME);
    for (i, line) in SCHOOL_LINES.iter().enumerate() {
        page.text("F1", 9, right, 786 - 12 * i as u32, line);
    }
    page.rule(740);
    page.text("F2", 20, MARGIN, 705, &doc.title);
    page.text("F1", 10, MARGIN, 680, &doc.number);
    page.text(
        "F1",
        10,
        right,
        680,
        &format!("Date: {}", doc.issued_at.format("%d/%m/%Y")),
    );

    let mut y = 645;
    if let Some(badge) = &doc.badge {
        page.text("F2", 16, MARGIN, y, badge);
        y -= 35;
    }
    for (label, value) in &doc.lines {
        page.text("F2", 11, MARGIN, y, &format!("{}:", label));
        page.text("F1", 11, MARGIN + 130, y, value);
        y -= 20;
    }
    y -= 10;
    page.rule(y + 14);
    page.text("F2", 13, MARGIN, y - 6, &format!("{}:", doc.total.0));
    page.text("F2", 13, MARGIN + 130, y - 6, &doc.total.1);
    page.text("F1", 9, MARGIN, 80, &doc.footer);
    page.text("F1", 8, MARGIN, 66, &format!("{} - generated document", SCHOOL_NAME));

    assemble(&page.ops)
}

fn assemble(content: &[u8]) -> Vec<u8> {
    let mut objects: Vec<Vec<u8>> = vec![
        b"<< /Type /Catalog /Pages 2 0 R >>".to_vec(),
        b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_vec(),
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
             /Resources << /Font << /F1 4 0 R /F2 5 0 R >> >> /Contents 6 0 R >>",
            PAGE_WIDTH, PAGE_HEIGHT
        )
        .into_bytes(),
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_vec(),
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
            .to_vec(),
    ];
    let mut stream = format!("<< /Length {} >>\nstream\n", content.len()).into_bytes();
    stream.extend_from_slice(content);
    stream.extend_from_slice(b"\nendstream");
    objects.push(stream);

    let mut out = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        )
        .as_bytes(),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnrollmentStatus, PaymentStatus};

    fn enrollment() -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            last_name: "Ndiaye".into(),
            first_name: "Fatou".into(),
            email: "fatou@example.org".into(),
            phone: "+221 77 000 00 00".into(),
            formation: "dev-web".into(),
            access_code: "4821".into(),
            status: EnrollmentStatus::Validated,
            cohort: Some(3),
            enrollment_fee: Some(25_000),
            months: Some(6),
            monthly_fee: Some(50_000),
            active: true,
            formation_end_date: None,
            validated_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn amounts_are_grouped_by_thousands() {
        assert_eq!(format_amount(0), "0 FCFA");
        assert_eq!(format_amount(950), "950 FCFA");
        assert_eq!(format_amount(50_000), "50 000 FCFA");
        assert_eq!(format_amount(1_250_000), "1 250 000 FCFA");
        assert_eq!(format_amount(-100_000), "-100 000 FCFA");
    }

    #[test]
    fn receipt_numbers_are_short_and_stable() {
        let id = Uuid::parse_str("0a1b2c3d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(receipt_number(&id), "N° 0A1B2C3D");
    }

    #[test]
    fn text_is_escaped_for_pdf_strings() {
        assert_eq!(pdf_text("a(b)c\\"), b"(a\\(b\\)c\\\\)".to_vec());
        assert_eq!(pdf_text("é"), vec![b'(', 0xE9, b')']);
        assert_eq!(pdf_text("€"), b"(?)".to_vec());
    }

    #[test]
    fn payment_receipt_is_a_well_formed_pdf() {
        let e = enrollment();
        let p = Payment {
            id: Uuid::new_v4(),
            enrollment_id: e.id,
            month: 3,
            amount: 50_000,
            status: PaymentStatus::Validated,
            receipt_path: None,
            rejection_reason: None,
            validated_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let pdf = payment_receipt(&e, &p, Utc::now());
        assert!(pdf.starts_with(b"%PDF-1.4"));
        assert!(pdf.ends_with(b"%%EOF\n"));
        assert!(find(&pdf, b"(MONTH 3)").is_some());
        assert!(find(&pdf, b"(50 000 FCFA)").is_some());

        // startxref must point at the xref table.
        let sx = find(&pdf, b"startxref\n").unwrap() + b"startxref\n".len();
        let end = sx + pdf[sx..].iter().position(|b| *b == b'\n').unwrap();
        let offset: usize = std::str::from_utf8(&pdf[sx..end]).unwrap().parse().unwrap();
        assert!(pdf[offset..].starts_with(b"xref\n0 7\n"));

        // every object offset in the table lands on its header.
        let table = &pdf[offset + b"xref\n0 7\n".len()..];
        for n in 1..=6usize {
            let entry = &table[n * 20..n * 20 + 10];
            let at: usize = std::str::from_utf8(entry).unwrap().parse().unwrap();
            assert!(pdf[at..].starts_with(format!("{} 0 obj", n).as_bytes()));
        }
    }

    #[test]
    fn enrollment_receipt_lists_terms() {
        let pdf = enrollment_receipt(&enrollment(), Utc::now());
        assert!(find(&pdf, b"(25 000 FCFA)").is_some());
        assert!(find(&pdf, b"(300 000 FCFA)").is_some());
        assert!(find(&pdf, b"(6 months)").is_some());
    }
}
