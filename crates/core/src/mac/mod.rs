/// A macro that allows lazily parsing a value from the environment variable,
/// with a fallback default value if the variable is not set or parsing fails.
///
/// # Parameters
///
/// - `$key`: An expression representing the name of the environment variable.
/// - `$t`: The type of the value to be parsed.
/// - `$default`: The default value to fall back to if the environment variable is not set or
///   parsing fails.
///
/// # Return Value
///
/// A lazy static variable of type `std::sync::LazyLock`, which holds the parsed
/// value from the environment variable or the default value.
#[macro_export]
macro_rules! lazy_env_parse {
	// With no default specified
	($key:expr_2021, Option<$t:ty>) => {
		std::sync::LazyLock::new(|| std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()))
	};
	// With a closure for the default value
	($key:expr_2021, $t:ty, || $default:expr_2021) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or_else(|| $default)
		})
	};
	// With a static expression for the default value
	($key:expr_2021, $t:ty, $default:expr_2021) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or($default)
		})
	};
}

#[cfg(test)]
mod test {
	use std::sync::LazyLock;

	#[test]
	fn lazy_env_parse_falls_back_to_default() {
		static VALUE: LazyLock<u32> = lazy_env_parse!("VBSCAN_TEST_UNSET_VARIABLE", u32, 42);
		assert_eq!(*VALUE, 42);
	}

	#[test]
	fn lazy_env_parse_reads_the_environment() {
		// SAFETY: no other test reads or writes this variable
		unsafe { std::env::set_var("VBSCAN_TEST_SET_VARIABLE", "17") };
		static VALUE: LazyLock<u32> = lazy_env_parse!("VBSCAN_TEST_SET_VARIABLE", u32, 42);
		assert_eq!(*VALUE, 17);
	}

	#[test]
	fn lazy_env_parse_optional() {
		static VALUE: LazyLock<Option<u64>> =
			lazy_env_parse!("VBSCAN_TEST_UNSET_OPTIONAL", Option<u64>);
		assert_eq!(*VALUE, None);
	}
}
