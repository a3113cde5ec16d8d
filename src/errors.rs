/*!
Error types

The taxonomy: configuration errors, I/O, migration-file parse errors, ledger
errors, normalized query errors (carrying the offending query text and,
where extractable, a character offset), strict-ordering violations,
not-found conditions, connectivity failures, and "driver doesn't support
this" errors.
*/

use std;
use url;

#[cfg(feature = "d-sqlite")]
use rusqlite;

#[cfg(feature = "d-postgres")]
use postgres;

#[cfg(feature = "d-mysql")]
use mysql;

#[cfg(feature = "d-clickhouse")]
use reqwest;

error_chain! {
    foreign_links {
        Io(std::io::Error);
        StringUtf8Error(std::string::FromUtf8Error);
        StrUtf8Error(std::str::Utf8Error);
        UrlParse(url::ParseError);
        Regex(regex::Error);
        Sqlite(rusqlite::Error) #[cfg(feature="d-sqlite")];
        Postgres(postgres::Error) #[cfg(feature="d-postgres")];
        MySql(mysql::Error) #[cfg(feature="d-mysql")];
        Reqwest(reqwest::Error) #[cfg(feature="d-clickhouse")];
    }
    errors {
        /// Bad URL, unknown driver scheme, bad configuration option.
        Config(s: String) {
            description("ConfigError")
            display("ConfigError: {}", s)
        }
        /// A migration file could not be parsed into sections.
        Parse(s: String) {
            description("ParseError")
            display("ParseError: {}", s)
        }
        /// The applied-migrations ledger could not be created, read or written.
        Ledger(s: String) {
            description("LedgerError")
            display("LedgerError: {}", s)
        }
        /// A SQL statement failed. Carries the offending query text and,
        /// when the underlying driver can extract one, a character offset
        /// into that text.
        Query(query: String, position: Option<usize>, underlying: String) {
            description("QueryError")
            display("QueryError: {}{}\n  query: {}", underlying,
                match position {
                    Some(p) => format!(" (at character {})", p),
                    None => String::new(),
                },
                query)
        }
        /// A pending migration sorts before an already-applied one under `--strict`.
        Ordering(pending: String, applied: String) {
            description("OrderingError")
            display("OrderingError: pending migration {} precedes already-applied migration {}", pending, applied)
        }
        /// Rollback requested with an empty ledger, or a ledger version has no
        /// corresponding file on disk.
        NotFound(s: String) {
            description("NotFound")
            display("NotFound: {}", s)
        }
        /// Opening a connection, pinging, or waiting for the database timed out
        /// or otherwise failed.
        Connectivity(s: String) {
            description("Connectivity")
            display("Connectivity: {}", s)
        }
        /// The driver cannot perform the requested administrative operation
        /// (e.g. `CreateDatabase` on Spanner).
        Unsupported(s: String) {
            description("Unsupported")
            display("Unsupported: {}", s)
        }
        /// Sentinel used by `status`/`rollback` to signal "nothing to do"
        /// without treating it as a hard failure.
        NothingPending(s: String) {
            description("NothingPending")
            display("NothingPending: {}", s)
        }
    }
}

impl Error {
    /// `true` if this is the "nothing pending / nothing to roll back" sentinel.
    pub fn is_nothing_pending(&self) -> bool {
        matches!(*self.kind(), ErrorKind::NothingPending(_))
    }

    /// `true` if this is a strict-ordering violation.
    pub fn is_ordering(&self) -> bool {
        matches!(*self.kind(), ErrorKind::Ordering(_, _))
    }
}

/// Build a normalized `Query` error from a query body and an underlying
/// driver error, with an optional character offset the driver extracted.
pub fn query_error<E: std::fmt::Display>(query: &str, position: Option<usize>, underlying: E) -> Error {
    ErrorKind::Query(query.to_owned(), position, underlying.to_string()).into()
}

/// Build a one-`String`-field `ErrorKind` variant from a `format!`-style
/// template, as an `Error` value (for use in `.map_err(|e| format_err!(...))`).
#[macro_export]
macro_rules! format_err {
    ($kind:path, $($arg:tt)*) => {
        $crate::errors::Error::from($kind(format!($($arg)*)))
    };
}

/// Same as `format_err!`, but returns from the enclosing function with the
/// built error wrapped in `Err(...)`.
#[macro_export]
macro_rules! bail_fmt {
    ($kind:path, $($arg:tt)*) => {
        return Err($crate::format_err!($kind, $($arg)*))
    };
}
