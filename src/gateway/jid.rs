//! Chat identifier helpers.
//!
//! A chat identifier is `<local>@<domain>`. One-to-one chats use
//! [`USER_DOMAIN`], groups use [`GROUP_DOMAIN`]. Device-scoped identities
//! carry a `:<device>` suffix on the local part.

/// Domain of one-to-one chat identifiers.
pub const USER_DOMAIN: &str = "s.whatsapp.net";

/// Domain of group chat identifiers.
pub const GROUP_DOMAIN: &str = "g.us";

const DOMAIN_SEPARATOR: char = '@';
const DEVICE_SEPARATOR: char = ':';

/// Qualify a destination: identifiers that already carry a domain are kept,
/// bare numbers get the one-to-one domain.
pub fn normalize(to: &str) -> String {
    let to = to.trim();
    if to.contains(DOMAIN_SEPARATOR) {
        to.to_owned()
    } else {
        format!("{to}{DOMAIN_SEPARATOR}{USER_DOMAIN}")
    }
}

/// Whether the identifier names a group chat.
pub fn is_group(chat_id: &str) -> bool {
    chat_id
        .rsplit_once(DOMAIN_SEPARATOR)
        .is_some_and(|(_, domain)| domain == GROUP_DOMAIN)
}

/// Local part of an identifier, without domain or device suffix.
pub fn local_part(chat_id: &str) -> &str {
    let user = chat_id
        .split_once(DOMAIN_SEPARATOR)
        .map_or(chat_id, |(user, _)| user);
    user.split_once(DEVICE_SEPARATOR)
        .map_or(user, |(number, _)| number)
}

/// Phone number of the linked account, derived from its session identity.
pub fn phone_from_identity(user_id: &str) -> Option<String> {
    let number = local_part(user_id);
    (!number.is_empty()).then(|| number.to_owned())
}
