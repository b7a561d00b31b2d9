use crate::api::handlers::{contact, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

/// The `OpenAPI` document for every documented route.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    api_router().split_for_parts().1
}

/// Documented routes. Anything mounted outside this router (`OPTIONS /health`)
/// is served but left out of the document.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(contact::submit))
        .routes(routes!(contact::verify))
        .routes(routes!(contact::resend))
        .routes(routes!(contact::cancel))
        .routes(routes!(contact::submission_status));

    router.get_openapi_mut().tags = Some(
        [
            ("contact", "Contact form gated by email verification codes"),
            ("health", "Service and store health"),
        ]
        .into_iter()
        .map(|(name, description)| {
            let mut tag = Tag::new(name);
            tag.description = Some(description.to_string());
            tag
        })
        .collect(),
    );

    router
}

/// Document header filled from the package manifest.
fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = env!("CARGO_PKG_AUTHORS")
        .split(';')
        .find_map(author_contact);
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        let mut license = License::new(spdx);
        license.identifier = Some(spdx.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

/// `Name <email>`, `Name` or `<email>`.
fn split_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, rest)) => (non_empty(name), non_empty(rest.trim_end().trim_end_matches('>'))),
        None => (non_empty(author), None),
    }
}

fn author_contact(author: &str) -> Option<Contact> {
    let (name, email) = split_author(author);
    if name.is_none() && email.is_none() {
        return None;
    }
    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authors_become_contacts() {
        assert_eq!(
            split_author("Team Contactgate <team@contactgate.dev>"),
            (Some("Team Contactgate"), Some("team@contactgate.dev"))
        );
        assert_eq!(split_author(" Solo "), (Some("Solo"), None));
        assert_eq!(split_author("<only@mail>"), (None, Some("only@mail")));
        assert!(author_contact("  ").is_none());
        assert_eq!(
            author_contact("Solo").and_then(|contact| contact.name),
            Some("Solo".to_string())
        );
    }

    #[test]
    fn openapi_lists_contact_paths() {
        let doc = openapi();
        for path in [
            "/health",
            "/v1/contact/submit",
            "/v1/contact/verify",
            "/v1/contact/resend",
            "/v1/contact/cancel",
            "/v1/contact/submissions/{id}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
    }
}
