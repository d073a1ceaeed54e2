// Recipient resolution for a workflow step

use lettre::Address;
use leadline_shared::{Audience, Channel, WorkflowStep};
use std::collections::HashSet;
use tracing::debug;

use crate::events::{Contact, LeadContext};

const MIN_PHONE_DIGITS: usize = 8;
// E.164 limit
const MAX_PHONE_DIGITS: usize = 15;

fn normalize_email(raw: &str) -> Option<String> {
    let candidate = raw.trim();
    candidate.parse::<Address>().ok().map(|_| candidate.to_string())
}

/// E.164 form of `raw`. International input (`+31 6 ...`, `0031 6 ...`) is
/// taken as is; a national number with a trunk `0` only resolves when a
/// default country code is known.
fn normalize_phone(raw: &str, default_country_code: Option<&str>) -> Option<String> {
    // "+31 (0)6 ..." keeps a trunk prefix that is never dialled
    let cleaned = raw.trim().replace("(0)", "");
    let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();

    let international = if cleaned.starts_with('+') {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if let Some(national) = digits.strip_prefix('0') {
        format!("{}{}", default_country_code?, national)
    } else {
        return None;
    };

    if international.starts_with('0') || !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&international.len()) {
        return None;
    }
    Some(format!("+{}", international))
}

fn normalize(channel: Channel, raw: &str, default_country_code: Option<&str>) -> Option<String> {
    match channel {
        Channel::Email => normalize_email(raw),
        Channel::WhatsApp => normalize_phone(raw, default_country_code),
    }
}

fn address_of(channel: Channel, contact: &Contact) -> Option<&str> {
    match channel {
        Channel::Email => contact.email.as_deref(),
        Channel::WhatsApp => contact.phone.as_deref(),
    }
}

fn organization_address(channel: Channel, context: &LeadContext) -> Option<&str> {
    match channel {
        Channel::Email => context.organization.email.as_deref(),
        Channel::WhatsApp => context.organization.phone.as_deref(),
    }
}

/// Addresses a step delivers to: the audience's primary contact, then any
/// contacts the step opts into, then its explicit list for the channel.
/// Invalid entries are dropped and duplicates collapse case-insensitively.
/// `default_country_code` (digits only) completes national phone numbers.
pub fn resolve_recipients(
    step: &WorkflowStep,
    context: &LeadContext,
    default_country_code: Option<&str>,
) -> Vec<String> {
    let channel = step.channel;
    let config = &step.recipients;
    let partner = context.partner.as_ref();

    let mut candidates: Vec<&str> = Vec::new();
    let primary = match step.audience {
        Audience::Lead => address_of(channel, &context.lead),
        Audience::Partner => partner.and_then(|p| address_of(channel, p)),
        Audience::Internal => organization_address(channel, context),
    };
    candidates.extend(primary);

    if config.include_lead {
        candidates.extend(address_of(channel, &context.lead));
    }
    if config.include_partner {
        candidates.extend(partner.and_then(|p| address_of(channel, p)));
    }
    if config.include_organization {
        candidates.extend(organization_address(channel, context));
    }

    let explicit = match channel {
        Channel::Email => &config.emails,
        Channel::WhatsApp => &config.phones,
    };
    candidates.extend(explicit.iter().map(String::as_str));

    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for raw in candidates {
        match normalize(channel, raw, default_country_code) {
            Some(address) => {
                if seen.insert(address.to_lowercase()) {
                    recipients.push(address);
                }
            }
            None => debug!(step_id = %step.id, %channel, "Dropping invalid recipient '{}'", raw),
        }
    }

    recipients
}
