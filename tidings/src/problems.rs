// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tidings.
//
// tidings is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tidings is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tidings.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Problems
//!
//! Every failure tidings reports to a caller goes out in the same envelope:
//!
//! ```json
//! {"errors": [{"code": 1003, "message": "user email is not valid"}, ...]}
//! ```
//!
//! Validation accumulates: a handler checks everything it can about a request, pushing a [Problem]
//! for each thing that's wrong, and only then bails. Each [Code] carries a stable number (grouped
//! into families: 1xxx users, 2xxx connections, 3xxx events, 4xxx authentication, 5xxx request &
//! server, 6xxx organizations, 7xxx members, 8xxx applications), a [Kind] which determines the HTTP
//! status, and the message the caller sees. A [Problem] may also carry an internal detail; that is
//! logged when the response is built, and never sent.

use std::fmt::Display;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// The broad category of a [Problem]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    Authentication,
    Validation,
    NotFound,
    Conflict,
    RateLimit,
    Hygiene,
    PayloadTooLarge,
    Internal,
}

impl Kind {
    pub fn status(&self) -> StatusCode {
        match self {
            Kind::Authentication => StatusCode::UNAUTHORIZED,
            Kind::Validation => StatusCode::BAD_REQUEST,
            Kind::NotFound => StatusCode::NOT_FOUND,
            Kind::Conflict => StatusCode::CONFLICT,
            Kind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Kind::Hygiene => StatusCode::BAD_REQUEST,
            Kind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

macro_rules! define_codes {
    ($($variant:ident = ($number:expr, $kind:ident, $message:expr)),* $(,)?) => {
        /// Every problem tidings knows how to report
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Code {
            $($variant),*
        }
        impl Code {
            pub fn number(&self) -> u16 {
                match self {
                    $(Code::$variant => $number),*
                }
            }
            pub fn kind(&self) -> Kind {
                match self {
                    $(Code::$variant => Kind::$kind),*
                }
            }
            pub fn message(&self) -> &'static str {
                match self {
                    $(Code::$variant => $message),*
                }
            }
        }
    };
}

define_codes! {
    UserNotActivated = (1000, Validation, "user not activated"),
    UserNotFound = (1001, NotFound, "user not found"),
    UserEmailInUse = (1002, Conflict, "user already exists with this email"),
    UserEmailInvalid = (1003, Validation, "user email is not valid"),
    UserFirstNameSize = (1004, Validation, "user first name must be between 2 and 40 characters"),
    UserIdInvalid = (1005, Validation, "user id is not valid"),
    UserLastNameSize = (1006, Validation, "user last name must be between 2 and 40 characters"),
    UserUsernameAndEmailMissing = (1007, Validation, "both username and email are empty"),
    UserUsernameInUse = (1008, Conflict, "user already exists with this username"),
    UserSearchTermTooShort = (1009, Validation, "search term must be at least 3 characters long"),
    UserUrlInvalid = (1010, Validation, "user url is not valid"),
    UserUsernameSize = (1012, Validation, "user username must be between 2 and 40 characters"),

    ConnectionAlreadyExists = (2000, Conflict, "connection already exists"),
    ConnectionNotFound = (2001, NotFound, "connection not found"),
    ConnectionTypeInvalid = (2002, Validation, "unexpected connection type"),
    ConnectionSelf = (2003, Validation, "user is connecting with itself"),
    ConnectionStateInvalid = (2005, Validation, "unexpected connection state"),

    GeoRadiusOrNearestMissing = (3000, Validation, "exactly one of radius or nearest must be given"),
    GeoRadiusTooSmall = (3001, Validation, "location radius must be at least 2 meters"),
    EventIdInvalid = (3002, Validation, "event id is not valid"),
    EventIdAlreadySet = (3003, Validation, "event id is already set"),
    EventVisibilityInvalid = (3004, Validation, "event visibility is not valid"),
    GeoNearestOutOfBounds = (3006, Validation, "nearest must be between 1 and 200"),
    EventNotFound = (3007, NotFound, "event not found"),
    EventTypeSize = (3008, Validation, "event type must be between 1 and 30 characters"),

    AuthGeneric = (4001, Authentication, "authentication error"),
    AuthUsernameAndEmailGiven = (4002, Authentication, "both username and email were given"),
    AuthUsernameAndEmailMissing = (4003, Authentication, "both username and email are empty"),
    AuthInvalidOrgCredentials = (4004, Authentication, "invalid organization credentials"),
    AuthInvalidMemberCredentials = (4005, Authentication, "invalid member credentials"),
    AuthInvalidAppCredentials = (4006, Authentication, "invalid application credentials"),
    AuthInvalidUserCredentials = (4007, Authentication, "invalid application user credentials"),
    AuthEmailInvalid = (4008, Authentication, "email address is not valid"),
    AuthMethodUnsupported = (4009, Authentication, "authentication method not supported"),
    AuthPasswordEmpty = (4010, Authentication, "password is empty"),
    AuthPasswordMismatch = (4011, Authentication, "password mismatch"),
    AuthSessionTokenMismatch = (4012, Authentication, "session token mismatch"),
    AuthSessionMissing = (4013, Authentication, "session token missing from request"),

    BadJson = (5001, Hygiene, "malformed json received"),
    UserAgentInvalid = (5002, Hygiene, "User-Agent header must be set"),
    ContentLengthInvalid = (5003, Hygiene, "Content-Length header is invalid"),
    ContentLengthMissing = (5004, Hygiene, "Content-Length header missing"),
    ContentLengthMismatch = (5005, Hygiene, "Content-Length header size mismatch"),
    ContentTypeMismatch = (5006, Hygiene, "Content-Type header mismatch"),
    ContentTypeMissing = (5007, Hygiene, "Content-Type header missing"),
    SearchTermsMissing = (5009, Validation, "no known search terms supplied"),
    FloatParse = (5010, Validation, "failed to parse a floating point value"),
    PayloadTooLarge = (5011, PayloadTooLarge, "payload too big"),
    EmptyBody = (5012, Hygiene, "empty request body"),
    RateLimitExceeded = (5013, RateLimit, "too many requests"),
    NotImplemented = (5500, Internal, "not implemented yet"),
    InvalidHandler = (5502, Internal, "invalid handler"),
    Internal = (5504, Internal, "server internal error"),

    OrgDescriptionSize = (6000, Validation, "organization description must be at most 100 characters"),
    OrgMismatch = (6003, Conflict, "organization id mismatch"),
    OrgNameSize = (6005, Validation, "organization name must be between 3 and 40 characters"),
    OrgNotFound = (6006, NotFound, "organization not found"),

    MemberEmailInvalid = (7000, Validation, "member email is not valid"),
    MemberFirstNameSize = (7001, Validation, "member first name must be between 2 and 40 characters"),
    MemberLastNameSize = (7002, Validation, "member last name must be between 2 and 40 characters"),
    MemberMismatch = (7003, Conflict, "member id mismatch"),
    MemberNotFound = (7004, NotFound, "member not found"),
    MemberPasswordSize = (7005, Validation, "member password must be between 4 and 60 characters"),
    MemberUsernameSize = (7007, Validation, "member username must be between 2 and 40 characters"),
    MemberEmailInUse = (7008, Conflict, "member already exists with this email"),
    MemberUsernameInUse = (7009, Conflict, "member already exists with this username"),

    AppDescriptionSize = (8001, Validation, "application description must be at most 100 characters"),
    AppIdInvalid = (8002, Validation, "application id is not valid"),
    AppNameSize = (8004, Validation, "application name must be between 2 and 40 characters"),
    AppNotFound = (8005, NotFound, "application not found"),
    AppUrlInvalid = (8006, Validation, "application url is not valid"),
    AppMismatch = (8007, Conflict, "application id mismatch"),
}

/// A single thing that went wrong
#[derive(Clone, Debug)]
pub struct Problem {
    code: Code,
    internal: Option<String>,
}

impl Problem {
    pub fn new(code: Code) -> Problem {
        Problem {
            code,
            internal: None,
        }
    }
    /// A problem whose cause is only of interest to us
    pub fn internal(code: Code, detail: impl Display) -> Problem {
        Problem {
            code,
            internal: Some(format!("{}", detail)),
        }
    }
    pub fn code(&self) -> Code {
        self.code
    }
    pub fn detail(&self) -> Option<&str> {
        self.internal.as_deref()
    }
}

/// An accumulation of [Problem]s
#[derive(Clone, Debug, Default)]
pub struct Problems(Vec<Problem>);

impl Problems {
    pub fn new() -> Problems {
        Problems(Vec::new())
    }
    pub fn push(&mut self, code: Code) {
        self.0.push(Problem::new(code));
    }
    pub fn push_internal(&mut self, code: Code, detail: impl Display) {
        self.0.push(Problem::internal(code, detail));
    }
    /// Record `code` unless `ok` holds
    pub fn check(&mut self, ok: bool, code: Code) {
        if !ok {
            self.push(code);
        }
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Take on all of `other`'s problems
    pub fn extend(&mut self, other: Problems) {
        self.0.extend(other.0);
    }
    pub fn codes(&self) -> Vec<Code> {
        self.0.iter().map(|p| p.code).collect()
    }
    pub fn problems(&self) -> &[Problem] {
        &self.0
    }
    /// Shorthand for an "internal server error" carrying `detail`
    pub fn server_error(detail: impl Display) -> Problems {
        Problem::internal(Code::Internal, detail).into()
    }
    /// The HTTP status for this accumulation: that of the first problem
    pub fn status(&self) -> StatusCode {
        self.0
            .first()
            .map(|p| p.code.kind().status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
    /// `Ok(())` if nothing has gone wrong, `Err(self)` otherwise
    pub fn into_result(self) -> std::result::Result<(), Problems> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            errors: self
                .0
                .iter()
                .map(|p| ErrorBody {
                    code: p.code.number(),
                    message: p.code.message().to_owned(),
                    documentation_url: None,
                })
                .collect(),
        }
    }
}

impl From<Code> for Problems {
    fn from(code: Code) -> Self {
        Problems(vec![Problem::new(code)])
    }
}

impl From<Problem> for Problems {
    fn from(problem: Problem) -> Self {
        Problems(vec![problem])
    }
}

impl Display for Problems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} {}", p.code.number(), p.code.message())?;
            if let Some(detail) = &p.internal {
                write!(f, " ({})", detail)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Problems {}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

/// The wire form of a [Problems] instance
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    pub errors: Vec<ErrorBody>,
}

impl axum::response::IntoResponse for Problems {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        // Internal details go to the log, never to the caller
        self.0
            .iter()
            .filter_map(|p| p.internal.as_ref().map(|detail| (p.code, detail)))
            .for_each(|(code, detail)| {
                if code.kind() == Kind::Internal {
                    error!("{} {}: {}", code.number(), code.message(), detail);
                } else {
                    info!("{} {}: {}", code.number(), code.message(), detail);
                }
            });
        (status, Json(self.to_envelope())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Problems>;

#[cfg(test)]
mod test {
    use super::*;

    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    #[test]
    fn accumulation() {
        let mut problems = Problems::new();
        problems.check(true, Code::UserEmailInvalid);
        assert!(problems.is_empty());
        problems.check(false, Code::UserEmailInvalid);
        problems.push(Code::UserUsernameSize);
        assert_eq!(
            problems.codes(),
            vec![Code::UserEmailInvalid, Code::UserUsernameSize]
        );
        assert_eq!(problems.status(), StatusCode::BAD_REQUEST);
        assert!(problems.into_result().is_err());
    }

    #[test]
    fn first_problem_determines_status() {
        let mut problems = Problems::new();
        problems.push(Code::UserNotFound);
        problems.push(Code::UserEmailInvalid);
        assert_eq!(problems.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Problems::from(Code::PayloadTooLarge).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            Problems::from(Code::RateLimitExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn internal_details_are_not_sent() {
        let rsp = Problems::server_error("connection refused (10.0.0.3:5432)").into_response();
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("10.0.0.3"));
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.errors.len(), 1);
        assert_eq!(envelope.errors[0].code, 5504);
        assert_eq!(envelope.errors[0].message, "server internal error");
    }
}
