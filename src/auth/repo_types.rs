use serde::{Deserialize, Deserializer};
use sqlx::FromRow;
use time::{Date, OffsetDateTime};

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,                     // primary key
    pub email: String,               // login subject, unique
    pub password_hash: String,       // argon2 PHC string
    pub is_active: bool,
    pub is_verified: bool,
    pub birthdate: Option<Date>,
    pub is_salaried: bool,
    pub address: Option<String>,
    pub password_reset_token: Option<String>,
    pub password_reset_token_expires: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn has_pending_reset(&self) -> bool {
        self.password_reset_token.is_some()
    }
}

/// Fields written on insert. The hash is computed before this is built.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub birthdate: Option<Date>,
    pub is_salaried: bool,
    pub address: Option<String>,
}

/// Optional profile data supplied on registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub birthdate: Option<Date>,
    #[serde(default)]
    pub is_salaried: bool,
    pub address: Option<String>,
}

/// Partial update of a user.
///
/// `None` leaves the stored value alone. For nullable columns the inner
/// option distinguishes "set to null" (`Some(None)`) from "set to value".
/// `password` is plaintext; the gateway hashes it before anything is stored,
/// so [`UserPatch::apply_to`] never touches `password_hash`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub birthdate: Option<Option<Date>>,
    pub is_salaried: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub address: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.password.is_none()
            && self.birthdate.is_none()
            && self.is_salaried.is_none()
            && self.address.is_none()
            && self.is_active.is_none()
    }

    pub fn apply_to(&self, user: &mut User) {
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(birthdate) = self.birthdate {
            user.birthdate = birthdate;
        }
        if let Some(is_salaried) = self.is_salaried {
            user.is_salaried = is_salaried;
        }
        if let Some(address) = &self.address {
            user.address = address.clone();
        }
        if let Some(is_active) = self.is_active {
            user.is_active = is_active;
        }
    }
}

// A field that is present in JSON (even as null) becomes `Some(..)`.
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}
