mod tests_matchers;
