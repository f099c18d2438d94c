/// External collaborator: renders the admin page listing blacklisted ips.
/// Template engines are out of scope; this crate only specifies the
/// interface and ships a minimal plain-text implementation.
pub trait AdminView: Send + Sync {
    fn render(&self, blacklisted: &[String]) -> String;
}

#[derive(Clone, Copy, Default)]
pub struct PlainTextAdminView;

impl AdminView for PlainTextAdminView {
    fn render(&self, blacklisted: &[String]) -> String {
        if blacklisted.is_empty() {
            return "no blacklisted ips\n".to_string();
        }
        let mut out = String::from("blacklisted ips:\n");
        for ip in blacklisted {
            out.push_str(ip);
            out.push('\n');
        }
        out
    }
}

/// Picks out the form fields whose value is the literal `"on"`, the shape
/// a checkbox list posts back: each checked ip is a `<ip>=on` pair.
pub fn checked_ips(form: &[(String, String)]) -> Vec<String> {
    form.iter()
        .filter(|(_, value)| value == "on")
        .map(|(ip, _)| ip.clone())
        .collect()
}
