//! Topic placeholder substitution.

/// Substitutes `%Prefix%`, `%ClientId%`, `%DeviceName%`, `%ValueName%`,
/// `%Category%` in `template`, left-to-right, each occurrence exactly
/// once. Placeholders with no entry in `values` are left unchanged.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    'outer: while let Some(start) = rest.find('%') {
        let (before, after_percent) = rest.split_at(start);
        out.push_str(before);
        let after_percent = &after_percent[1..];

        if let Some(end) = after_percent.find('%') {
            let name = &after_percent[..end];
            for (key, value) in values {
                if *key == name {
                    out.push_str(value);
                    rest = &after_percent[end + 1..];
                    continue 'outer;
                }
            }
            // Unknown placeholder: leave the literal `%name%` unchanged.
            out.push('%');
            out.push_str(name);
            out.push('%');
            rest = &after_percent[end + 1..];
        } else {
            // Unterminated `%`: pass the rest through literally.
            out.push('%');
            out.push_str(after_percent);
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

/// Convenience builder for the five placeholders the forwarder knows
/// about.
pub struct TopicContext<'a> {
    pub prefix: &'a str,
    pub client_id: &'a str,
    pub device_name: &'a str,
    pub value_name: Option<&'a str>,
    pub category: Option<&'a str>,
}

impl<'a> TopicContext<'a> {
    pub fn render(&self, template: &str) -> String {
        let mut values = vec![
            ("Prefix", self.prefix),
            ("ClientId", self.client_id),
            ("DeviceName", self.device_name),
        ];
        if let Some(value_name) = self.value_name {
            values.push(("ValueName", value_name));
        }
        if let Some(category) = self.category {
            values.push(("Category", category));
        }
        substitute(template, &values)
    }
}
